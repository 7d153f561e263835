//! 可订阅的对话状态
//!
//! 只有编排器写入；界面通过 `watch::Receiver` 观察每次修改。

use std::sync::Arc;

use tokio::sync::watch;

use crate::database::models::{ConversationEntry, ResponseRecord};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    /// 最近更新的在前
    pub conversations: Vec<ConversationEntry>,
    /// 每次修改递增
    pub revision: u64,
}

impl ConversationState {
    pub fn get(&self, id: &str) -> Option<&ConversationEntry> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// 在所有对话中查找响应记录
    pub fn record(&self, record_id: &str) -> Option<&ResponseRecord> {
        self.conversations.iter().find_map(|c| c.record(record_id))
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    tx: Arc<watch::Sender<ConversationState>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConversationState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.tx.borrow().clone()
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationEntry> {
        self.tx.borrow().get(id).cloned()
    }

    /// 插入或替换，并移到最前
    pub fn upsert(&self, entry: ConversationEntry) {
        self.tx.send_modify(|state| {
            state.conversations.retain(|c| c.id != entry.id);
            state.conversations.insert(0, entry);
            state.revision += 1;
        });
    }

    /// 修改一条记录；`f` 返回 false 时不通知订阅者。返回修改后的记录
    pub fn update_record<F>(&self, conversation_id: &str, record_id: &str, f: F) -> Option<ResponseRecord>
    where
        F: FnOnce(&mut ResponseRecord) -> bool,
    {
        let mut updated = None;
        self.tx.send_if_modified(|state| {
            let Some(record) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
                .and_then(|c| c.record_mut(record_id))
            else {
                return false;
            };

            if !f(record) {
                return false;
            }
            updated = Some(record.clone());
            state.revision += 1;
            true
        });
        updated
    }

    pub fn remove(&self, id: &str) -> bool {
        self.tx.send_if_modified(|state| {
            let before = state.conversations.len();
            state.conversations.retain(|c| c.id != id);
            let removed = state.conversations.len() != before;
            if removed {
                state.revision += 1;
            }
            removed
        })
    }

    pub fn clear(&self) {
        self.tx.send_modify(|state| {
            state.conversations.clear();
            state.revision += 1;
        });
    }

    pub fn replace_all(&self, conversations: Vec<ConversationEntry>) {
        self.tx.send_modify(|state| {
            state.conversations = conversations;
            state.revision += 1;
        });
    }
}
