//! 持久化接口
//!
//! 保险库与编排器只依赖这个 trait；SQLite 实现见 [`crate::database::SqliteStorage`]。

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::database::models::{ConversationEntry, CustomProviderRecord, EncryptedSecret, ResponseRecord};

pub trait Storage: Send + Sync {
    /// 写入或覆盖某个提供商的加密凭证
    fn store_api_key(&self, secret: &EncryptedSecret) -> Result<()>;

    fn get_api_key(&self, provider_name: &str) -> Result<Option<EncryptedSecret>>;

    fn get_all_api_keys(&self) -> Result<Vec<EncryptedSecret>>;

    /// 返回是否确实删除了记录
    fn delete_api_key(&self, provider_name: &str) -> Result<bool>;

    fn touch_api_key(&self, provider_name: &str, used_at: DateTime<Utc>) -> Result<()>;

    /// 写入对话及其全部响应
    fn save_conversation(&self, entry: &ConversationEntry) -> Result<()>;

    /// 只写入单条响应（行级更新）
    fn save_response(&self, record: &ResponseRecord) -> Result<()>;

    fn get_conversation(&self, id: &str) -> Result<Option<ConversationEntry>>;

    /// 按更新时间倒序
    fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationEntry>>;

    fn delete_conversation(&self, id: &str) -> Result<bool>;

    /// 删除全部对话，返回删除数量
    fn clear_history(&self) -> Result<usize>;

    fn save_custom_provider(&self, record: &CustomProviderRecord) -> Result<()>;

    fn get_custom_provider(&self, id: &str) -> Result<Option<CustomProviderRecord>>;

    fn list_custom_providers(&self) -> Result<Vec<CustomProviderRecord>>;

    fn delete_custom_provider(&self, id: &str) -> Result<bool>;
}
