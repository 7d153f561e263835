//! 持久化数据模型
//!
//! 对话、响应记录、加密凭证与自定义提供商

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::errors::{ErrorCode, LlmError};
use crate::llm::interface::Usage;
use crate::llm::model_resolver::{custom_provider_id, ProviderKind, Target};

/// 响应状态
///
/// `pending → streaming → success | error`，或 `pending/streaming → cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Pending,
    Streaming,
    Success,
    Error,
    Cancelled,
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseStatus::Success | ResponseStatus::Error | ResponseStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Streaming => "streaming",
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ResponseStatus::Pending),
            "streaming" => Some(ResponseStatus::Streaming),
            "success" => Some(ResponseStatus::Success),
            "error" => Some(ResponseStatus::Error),
            "cancelled" => Some(ResponseStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个目标在某一轮的响应
///
/// 进入终止状态后，所有修改方法都不再生效并返回 `false`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: String,
    pub conversation_id: String,
    pub provider_id: String,
    pub model: String,
    /// 本轮用户原始输入（不是重建后的上下文）
    pub prompt: String,
    pub response: String,
    pub status: ResponseStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ResponseRecord {
    pub fn pending(conversation_id: &str, target: &Target, prompt: impl Into<String>, turn: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            provider_id: target.provider.clone(),
            model: target.model.clone(),
            prompt: prompt.into(),
            response: String::new(),
            status: ResponseStatus::Pending,
            timestamp: Utc::now(),
            duration_ms: None,
            error: None,
            error_code: None,
            turn,
            usage: None,
            finish_reason: None,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.provider_id.clone(), self.model.clone())
    }

    pub fn target_key(&self) -> String {
        self.target().key()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn begin_streaming(&mut self) -> bool {
        if self.status != ResponseStatus::Pending {
            return false;
        }
        self.status = ResponseStatus::Streaming;
        true
    }

    /// 追加增量文本；pending 记录会先切到 streaming
    pub fn append_delta(&mut self, delta: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ResponseStatus::Streaming;
        self.response.push_str(delta);
        true
    }

    /// 成功结束；`content` 为 `Some` 时替换已累积的文本（非流式结果）
    pub fn complete(&mut self, content: Option<String>, usage: Option<Usage>, finish_reason: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        if let Some(content) = content {
            self.response = content;
        }
        self.usage = usage;
        self.finish_reason = finish_reason;
        self.finish(ResponseStatus::Success);
        true
    }

    pub fn fail(&mut self, error: &LlmError) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.error = Some(error.message.clone());
        self.error_code = Some(error.code);
        self.finish(ResponseStatus::Error);
        true
    }

    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.finish(ResponseStatus::Cancelled);
        true
    }

    fn finish(&mut self, status: ResponseStatus) {
        self.status = status;
        let elapsed = Utc::now().signed_duration_since(self.timestamp);
        self.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
    }
}

/// 一次对话：首轮 prompt、目标集合与所有轮次的响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: String,
    pub prompt: String,
    pub targets: Vec<Target>,
    pub responses: Vec<ResponseRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(prompt: impl Into<String>, targets: Vec<Target>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            targets,
            responses: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 下一轮的轮次号（首轮为 0）
    pub fn next_turn(&self) -> u32 {
        self.responses.iter().map(|r| r.turn + 1).max().unwrap_or(0)
    }

    /// 加入尚未存在的目标
    pub fn add_targets(&mut self, targets: &[Target]) {
        for target in targets {
            if !self.targets.contains(target) {
                self.targets.push(target.clone());
            }
        }
    }

    pub fn record(&self, record_id: &str) -> Option<&ResponseRecord> {
        self.responses.iter().find(|r| r.id == record_id)
    }

    pub fn record_mut(&mut self, record_id: &str) -> Option<&mut ResponseRecord> {
        self.responses.iter_mut().find(|r| r.id == record_id)
    }

    /// 某个目标的全部响应，按轮次排序
    pub fn responses_for(&self, target_key: &str) -> Vec<&ResponseRecord> {
        let mut records: Vec<_> = self
            .responses
            .iter()
            .filter(|r| r.target_key() == target_key)
            .collect();
        records.sort_by_key(|r| r.turn);
        records
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 加密记录的格式版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSchema {
    /// 加盐派生之前写入，没有 salt
    Legacy,
    Salted,
}

impl SecretSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretSchema::Legacy => "legacy",
            SecretSchema::Salted => "salted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "legacy" => Some(SecretSchema::Legacy),
            "salted" => Some(SecretSchema::Salted),
            _ => None,
        }
    }
}

/// 加密存储的 API Key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// 提供商 ID，自定义提供商为 `custom:<id>`
    pub provider_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// base64 密文（含 GCM 标签）
    pub encrypted_data: String,
    /// base64，12 字节
    pub iv: String,
    /// base64，16 字节；legacy 记录为空
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub key_id: String,
    pub schema: SecretSchema,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// 自定义提供商的协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomProviderType {
    /// OpenAI 兼容接口
    OpenAI,
    /// Anthropic 兼容接口
    Anthropic,
}

impl CustomProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomProviderType::OpenAI => "openai",
            CustomProviderType::Anthropic => "anthropic",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match ProviderKind::parse(value)? {
            ProviderKind::OpenAI => Ok(CustomProviderType::OpenAI),
            ProviderKind::Anthropic => Ok(CustomProviderType::Anthropic),
            other => anyhow::bail!("自定义提供商不支持 {} 协议", other),
        }
    }
}

/// 用户添加的提供商；API Key 存在保险库的 `custom:<id>` 下
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomProviderRecord {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub provider_type: CustomProviderType,
    /// 上游真实模型名
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl CustomProviderRecord {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        provider_type: CustomProviderType,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_type,
            model: model.into(),
            created_at: Utc::now(),
        }
    }

    pub fn provider_id(&self) -> String {
        custom_provider_id(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ResponseRecord {
        ResponseRecord::pending("conv", &Target::new("openai", "gpt-4o"), "hi", 0)
    }

    #[test]
    fn test_record_lifecycle() {
        let mut r = record();
        assert_eq!(r.status, ResponseStatus::Pending);
        assert!(r.append_delta("Hel"));
        assert_eq!(r.status, ResponseStatus::Streaming);
        assert!(r.append_delta("lo"));
        assert!(r.complete(None, Some(Usage::new(1, 2)), Some("stop".into())));
        assert_eq!(r.status, ResponseStatus::Success);
        assert_eq!(r.response, "Hello");
        assert!(r.duration_ms.is_some());
    }

    #[test]
    fn test_terminal_record_is_frozen() {
        let mut r = record();
        assert!(r.cancel());
        assert!(!r.append_delta("late"));
        assert!(!r.complete(Some("late".into()), None, None));
        assert!(!r.fail(&LlmError::new(ErrorCode::NetworkError, "x")));
        assert!(!r.cancel());
        assert_eq!(r.status, ResponseStatus::Cancelled);
        assert!(r.response.is_empty());
    }

    #[test]
    fn test_fail_sets_code() {
        let mut r = record();
        assert!(r.fail(&LlmError::new(ErrorCode::InvalidApiKey, "bad key")));
        assert_eq!(r.error_code, Some(ErrorCode::InvalidApiKey));
        assert_eq!(r.error.as_deref(), Some("bad key"));
    }

    #[test]
    fn test_begin_streaming_only_from_pending() {
        let mut r = record();
        assert!(r.begin_streaming());
        assert!(!r.begin_streaming());
    }

    #[test]
    fn test_next_turn_and_responses_for() {
        let target = Target::new("openai", "gpt-4o");
        let mut entry = ConversationEntry::new("hi", vec![target.clone()]);
        assert_eq!(entry.next_turn(), 0);

        let mut second = ResponseRecord::pending(&entry.id, &target, "again", 1);
        second.complete(Some("b".into()), None, None);
        let mut first = ResponseRecord::pending(&entry.id, &target, "hi", 0);
        first.complete(Some("a".into()), None, None);
        entry.responses.push(second);
        entry.responses.push(first);

        assert_eq!(entry.next_turn(), 2);
        let ordered: Vec<_> = entry.responses_for("openai:gpt-4o").iter().map(|r| r.turn).collect();
        assert_eq!(ordered, vec![0, 1]);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ResponseStatus::Pending,
            ResponseStatus::Streaming,
            ResponseStatus::Success,
            ResponseStatus::Error,
            ResponseStatus::Cancelled,
        ] {
            assert_eq!(ResponseStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_custom_provider_record() {
        let record = CustomProviderRecord::new("My Proxy", "https://proxy.local/v1/", CustomProviderType::OpenAI, "gpt-4o");
        assert_eq!(record.base_url, "https://proxy.local/v1");
        assert!(record.provider_id().starts_with("custom:"));
        assert_eq!(CustomProviderType::parse("claude").unwrap(), CustomProviderType::Anthropic);
        assert!(CustomProviderType::parse("ollama").is_err());
    }
}
