//! 多提供商 Prompt 编排
//!
//! 一次提交扇出到多个 (提供商, 模型) 目标，各目标独立运行、独立失败、独立取消；
//! 续写时每个目标只看到自己的历史轮次。

pub mod context;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use secrecy::SecretString;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::database::models::{ConversationEntry, ResponseRecord, ResponseStatus};
use crate::database::storage::Storage;
use crate::llm::errors::LlmError;
use crate::llm::factory::AdapterRegistry;
use crate::llm::interface::{GenerationOutput, GenerationRequest, LLMService, ProviderConfig};
use crate::llm::model_resolver::{is_custom_id, resolve_targets, ModelResolver, Target};
use crate::llm::registry::Capability;
use crate::llm::stream::cancellable;
use crate::logging::{LatencyMonitor, Timer};
use crate::vault::CredentialVault;

pub use context::reconstruct_prompt;
pub use state::{ConversationState, ConversationStore};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("prompt 不能为空")]
    EmptyPrompt,

    #[error("没有可用的目标: {0}")]
    NoTargets(String),

    #[error("对话不存在: {0}")]
    ConversationNotFound(String),

    #[error("存储失败: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// 一次提交
#[derive(Debug, Clone, Default)]
pub struct PromptSubmission {
    pub prompt: String,
    pub providers: Vec<String>,
    pub models: Vec<String>,
    /// 续写的对话 ID
    pub continue_conversation: Option<String>,
    /// 续写时的新消息，未设置时使用 `prompt`
    pub user_message: Option<String>,
    pub system_prompt: Option<String>,
    /// 覆盖配置中的默认流式设置
    pub stream: Option<bool>,
}

impl PromptSubmission {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn continuation(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            continue_conversation: Some(conversation_id.into()),
            user_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = providers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    fn message(&self) -> &str {
        match (&self.continue_conversation, &self.user_message) {
            (Some(_), Some(message)) => message,
            _ => &self.prompt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 单个目标的超时
    pub timeout: Duration,
    pub stream: bool,
    pub defaults: ProviderConfig,
    pub slow_dispatch: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.request.timeout(),
            stream: config.request.stream,
            defaults: config.defaults.clone(),
            slow_dispatch: Duration::from_millis(config.logging.slow_dispatch_ms),
        }
    }
}

struct InFlight {
    conversation_id: String,
    token: CancellationToken,
}

/// 单个目标的调度任务
struct Dispatch {
    conversation_id: String,
    record_id: String,
    target: Target,
    adapter: Result<Arc<dyn LLMService>, LlmError>,
    api_key: Result<Arc<SecretString>, LlmError>,
    request: GenerationRequest,
    token: CancellationToken,
    /// 记录的权威副本；内存状态只是它的镜像
    record: Mutex<ResponseRecord>,
}

impl Dispatch {
    fn lock_record(&self) -> std::sync::MutexGuard<'_, ResponseRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 用内存中仍在运行的对话替换存储中的旧副本；不在列表中的放到最前
fn merge_live(mut loaded: Vec<ConversationEntry>, live: Vec<ConversationEntry>) -> Vec<ConversationEntry> {
    let mut missing = Vec::new();
    for entry in live {
        match loaded.iter_mut().find(|c| c.id == entry.id) {
            Some(slot) => *slot = entry,
            None => missing.push(entry),
        }
    }
    missing.extend(loaded);
    missing
}

pub struct PromptOrchestrator {
    registry: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    storage: Arc<dyn Storage>,
    store: ConversationStore,
    settings: OrchestratorSettings,
    inflight: Mutex<HashMap<String, InFlight>>,
    monitor: LatencyMonitor,
}

impl PromptOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        vault: Arc<CredentialVault>,
        storage: Arc<dyn Storage>,
        settings: OrchestratorSettings,
    ) -> Self {
        let monitor = LatencyMonitor::new(settings.slow_dispatch);
        Self {
            registry,
            vault,
            storage,
            store: ConversationStore::new(),
            settings,
            inflight: Mutex::new(HashMap::new()),
            monitor,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &LatencyMonitor {
        &self.monitor
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.store.subscribe()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.store.snapshot()
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationEntry> {
        self.store.conversation(id)
    }

    /// 把已保存的自定义提供商注册到适配器表
    pub fn load_custom_providers(&self) -> Result<usize, OrchestratorError> {
        let records = self.storage.list_custom_providers()?;
        let count = records.len();
        for record in records {
            self.registry.register_custom(record);
        }
        Ok(count)
    }

    /// 提交 prompt，所有目标结束后返回对话 ID；进度通过 `subscribe` 观察
    pub async fn submit_prompt(&self, submission: PromptSubmission) -> Result<String, OrchestratorError> {
        let message = submission.message().trim().to_string();
        if message.is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }

        let (mut entry, targets, continuing) = match &submission.continue_conversation {
            Some(id) => {
                let entry = self.find_conversation(id)?;
                let targets = if submission.providers.is_empty() && submission.models.is_empty() {
                    entry.targets.clone()
                } else {
                    self.resolve(&submission)?
                };
                (entry, targets, true)
            }
            None => {
                let targets = self.resolve(&submission)?;
                (ConversationEntry::new(message.clone(), targets.clone()), targets, false)
            }
        };

        if targets.is_empty() {
            return Err(OrchestratorError::NoTargets(format!("对话 {} 没有目标", entry.id)));
        }

        let turn = entry.next_turn();
        let stream = submission.stream.unwrap_or(self.settings.stream);
        let mut credentials: HashMap<String, Result<Arc<SecretString>, LlmError>> = HashMap::new();
        let mut dispatches = Vec::with_capacity(targets.len());
        let mut records = Vec::with_capacity(targets.len());

        for target in &targets {
            let record = ResponseRecord::pending(&entry.id, target, message.clone(), turn);
            let adapter = self.adapter_for(target);

            let api_key = match &adapter {
                Ok(adapter) if !adapter.requires_api_key() => Ok(Arc::new(SecretString::from(String::new()))),
                _ => credentials
                    .entry(target.credential_name().to_string())
                    .or_insert_with(|| self.decrypt(target.credential_name()))
                    .clone(),
            };

            let prompt = if continuing {
                reconstruct_prompt(&entry, &target.key(), &message)
            } else {
                message.clone()
            };

            let streams = match &adapter {
                Ok(adapter) => stream && adapter.supports_capability(&target.model, Capability::Streaming),
                Err(_) => stream,
            };
            let mut request = GenerationRequest::new(target.model.clone(), prompt)
                .with_stream(streams)
                .with_config(self.settings.defaults.clone());
            if let Some(system_prompt) = &submission.system_prompt {
                request = request.with_system_prompt(system_prompt.clone());
            }

            dispatches.push(Dispatch {
                conversation_id: entry.id.clone(),
                record_id: record.id.clone(),
                target: target.clone(),
                adapter,
                api_key,
                request,
                token: CancellationToken::new(),
                record: Mutex::new(record.clone()),
            });
            records.push(record);
        }

        entry.add_targets(&targets);
        entry.responses.extend(records);
        entry.touch();
        self.storage.save_conversation(&entry)?;

        let conversation_id = entry.id.clone();
        log::info!(
            "提交对话 {} 第 {} 轮，目标: {}",
            conversation_id,
            turn,
            targets.iter().map(|t| t.key()).collect::<Vec<_>>().join(", ")
        );

        {
            let mut inflight = self.lock_inflight();
            for dispatch in &dispatches {
                inflight.insert(
                    dispatch.record_id.clone(),
                    InFlight {
                        conversation_id: conversation_id.clone(),
                        token: dispatch.token.clone(),
                    },
                );
            }
        }
        self.store.upsert(entry);

        join_all(dispatches.into_iter().map(|dispatch| self.run(dispatch))).await;
        Ok(conversation_id)
    }

    /// 向对话的所有现有目标发送同一条消息
    pub async fn broadcast(&self, conversation_id: &str, message: &str) -> Result<String, OrchestratorError> {
        self.submit_prompt(PromptSubmission::continuation(conversation_id, message)).await
    }

    /// 取消单条记录；记录不在运行中时返回 false
    pub fn cancel_target(&self, record_id: &str) -> bool {
        let Some(inflight) = self.lock_inflight().remove(record_id) else {
            return false;
        };
        inflight.token.cancel();
        self.finish_cancelled(&inflight.conversation_id, record_id);
        true
    }

    /// 取消对话中所有运行中的记录，返回取消数量
    pub fn cancel_conversation(&self, conversation_id: &str) -> usize {
        let cancelled: Vec<(String, InFlight)> = {
            let mut inflight = self.lock_inflight();
            let ids: Vec<String> = inflight
                .iter()
                .filter(|(_, f)| f.conversation_id == conversation_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inflight.remove(&id).map(|f| (id, f)))
                .collect()
        };

        for (record_id, inflight) in &cancelled {
            inflight.token.cancel();
            self.finish_cancelled(&inflight.conversation_id, record_id);
        }
        cancelled.len()
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool, OrchestratorError> {
        self.cancel_conversation(conversation_id);
        let in_store = self.store.remove(conversation_id);
        let in_storage = self.storage.delete_conversation(conversation_id)?;
        Ok(in_store || in_storage)
    }

    /// 取消全部运行中的记录并清空历史
    pub fn clear_history(&self) -> Result<usize, OrchestratorError> {
        let drained: Vec<InFlight> = self.lock_inflight().drain().map(|(_, f)| f).collect();
        for inflight in &drained {
            inflight.token.cancel();
        }
        self.store.clear();
        let removed = self.storage.clear_history()?;
        log::info!("已清空 {} 个对话，取消 {} 个请求", removed, drained.len());
        Ok(removed)
    }

    /// 从存储加载最近的对话；上次运行遗留的未完成记录标记为 cancelled
    ///
    /// 仍有目标在运行的对话保留内存中的版本，不受 `limit` 影响。
    pub fn load_history(&self, limit: usize) -> Result<usize, OrchestratorError> {
        let mut conversations = self.storage.recent_conversations(limit)?;
        let running: HashSet<String> = self.lock_inflight().keys().cloned().collect();

        for entry in &mut conversations {
            for record in entry.responses.iter_mut() {
                if !record.is_terminal() && !running.contains(&record.id) && record.cancel() {
                    if let Err(e) = self.storage.save_response(record) {
                        log::warn!("保存记录 {} 失败: {:#}", record.id, e);
                    }
                }
            }
        }

        let live: Vec<ConversationEntry> = self
            .store
            .snapshot()
            .conversations
            .into_iter()
            .filter(|c| c.responses.iter().any(|r| running.contains(&r.id)))
            .collect();

        let count = conversations.len();
        self.store.replace_all(merge_live(conversations, live));
        Ok(count)
    }

    async fn run(&self, dispatch: Dispatch) {
        let target_key = dispatch.target.key();
        let timer = Timer::start_with_monitor(&target_key, self.monitor.clone());

        let outcome = tokio::select! {
            biased;
            _ = dispatch.token.cancelled() => None,
            result = self.execute(&dispatch) => Some(result),
        };

        match &outcome {
            None => {
                self.update(&dispatch, |r| r.cancel());
            }
            Some(Ok(())) => {}
            Some(Err(error)) => {
                log::warn!("[{}] {} ({})", target_key, error.message, error.code);
                self.update(&dispatch, |r| r.fail(error));
            }
        }

        self.lock_inflight().remove(&dispatch.record_id);

        let record = dispatch.lock_record().clone();
        timer.stop(record.status == ResponseStatus::Success);

        // 对话已被删除或清空时不再写回
        if outcome.is_none() && self.store.conversation(&dispatch.conversation_id).is_none() {
            return;
        }
        self.persist(&record);
    }

    /// 超时只约束首个结果和流式块之间的空闲间隔，不限制整个流的时长
    async fn execute(&self, dispatch: &Dispatch) -> Result<(), LlmError> {
        let adapter = dispatch.adapter.clone()?;
        let api_key = dispatch.api_key.clone()?;
        let idle = self.settings.timeout;
        let timed_out = || LlmError::timeout(idle).with_provider(dispatch.target.provider.clone());

        let output = tokio::time::timeout(idle, adapter.generate_text(dispatch.request.clone(), &api_key))
            .await
            .map_err(|_| timed_out())??;

        match output {
            GenerationOutput::Text(response) => {
                self.update(dispatch, move |r| {
                    r.complete(Some(response.content), response.usage, response.finish_reason)
                });
                Ok(())
            }
            GenerationOutput::Stream(chunks) => {
                self.update(dispatch, |r| r.begin_streaming());
                let mut chunks = cancellable(chunks, dispatch.token.clone());

                loop {
                    let next = tokio::time::timeout(idle, chunks.next()).await.map_err(|_| timed_out())?;
                    let Some(chunk) = next else { break };
                    let chunk = chunk?;
                    if chunk.is_complete {
                        let (usage, finish_reason) = chunk
                            .metadata
                            .map(|m| (m.usage, m.finish_reason))
                            .unwrap_or((None, None));
                        self.update(dispatch, move |r| r.complete(None, usage, finish_reason));
                        return Ok(());
                    }
                    self.update(dispatch, |r| r.append_delta(&chunk.content));
                }

                if dispatch.token.is_cancelled() {
                    return Ok(());
                }
                Err(LlmError::invalid_response("流在终止块之前结束"))
            }
        }
    }

    /// 修改调度持有的记录，再同步到可订阅状态
    fn update<F>(&self, dispatch: &Dispatch, f: F) -> bool
    where
        F: FnOnce(&mut ResponseRecord) -> bool,
    {
        let mirrored = {
            let mut record = dispatch.lock_record();
            if !f(&mut record) {
                return false;
            }
            record.clone()
        };

        self.store
            .update_record(&dispatch.conversation_id, &dispatch.record_id, move |r| {
                if r.is_terminal() {
                    return false;
                }
                *r = mirrored;
                true
            });
        true
    }

    fn resolve(&self, submission: &PromptSubmission) -> Result<Vec<Target>, OrchestratorError> {
        for provider in &submission.providers {
            if let Ok(id) = ModelResolver::canonical_provider(provider) {
                if is_custom_id(&id) {
                    self.ensure_custom(&id);
                }
            }
        }

        let targets = resolve_targets(&submission.providers, &submission.models, |provider, model| {
            self.registry.knows_model(provider, model)
        })
        .map_err(|e| OrchestratorError::NoTargets(format!("{:#}", e)))?;

        for target in targets.iter().filter(|t| t.is_custom()) {
            self.ensure_custom(&target.provider);
        }
        Ok(targets)
    }

    /// 自定义提供商首次使用时从存储加载
    fn ensure_custom(&self, provider_id: &str) {
        if self.registry.adapter(provider_id).is_ok() {
            return;
        }
        let Some(record_id) = provider_id.split_once(':').map(|(_, id)| id) else {
            return;
        };
        match self.storage.get_custom_provider(record_id) {
            Ok(Some(record)) => {
                self.registry.register_custom(record);
            }
            Ok(None) => log::debug!("自定义提供商不存在: {}", provider_id),
            Err(e) => log::warn!("读取自定义提供商 {} 失败: {:#}", provider_id, e),
        }
    }

    fn adapter_for(&self, target: &Target) -> Result<Arc<dyn LLMService>, LlmError> {
        if target.is_custom() {
            self.ensure_custom(&target.provider);
        }
        self.registry.adapter(&target.provider)
    }

    fn decrypt(&self, credential: &str) -> Result<Arc<SecretString>, LlmError> {
        self.vault
            .decrypt_api_key(credential)
            .map(Arc::new)
            .map_err(|e| LlmError::from(e).with_provider(credential))
    }

    fn find_conversation(&self, id: &str) -> Result<ConversationEntry, OrchestratorError> {
        if let Some(entry) = self.store.conversation(id) {
            return Ok(entry);
        }
        self.storage
            .get_conversation(id)?
            .ok_or_else(|| OrchestratorError::ConversationNotFound(id.to_string()))
    }

    fn finish_cancelled(&self, conversation_id: &str, record_id: &str) {
        if let Some(record) = self.store.update_record(conversation_id, record_id, |r| r.cancel()) {
            log::info!("已取消 {} ({})", record.target_key(), record_id);
            self.persist(&record);
        }
    }

    fn persist(&self, record: &ResponseRecord) {
        if let Err(e) = self.storage.save_response(record) {
            log::warn!("保存记录 {} 失败: {:#}", record.id, e);
        }
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
