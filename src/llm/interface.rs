//! LLM 服务统一接口
//!
//! 定义跨厂商的适配器契约：各提供商只实现原生调用（`chat_completion`、
//! `stream_completion` 等钩子），能力检查、模型查找、消息组装、参数校验、
//! 错误归一化与流式统一由 trait 的默认方法一次性实现。

use std::ops::RangeInclusive;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::llm::errors::{normalize_error, LlmError};
use crate::llm::registry::{Capability, ModelInfo};
use crate::llm::stream::unify_stream;

/// 聊天消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// 系统提示词
    System,
    /// 用户消息
    User,
    /// 助手回复
    Assistant,
}

/// 聊天消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// 提供商可调参数
///
/// 未设置的字段使用提供商默认值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// 提供商声明的参数约束
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfigSchema {
    pub temperature: RangeInclusive<f32>,
    pub top_p: RangeInclusive<f32>,
    pub max_tokens_limit: u32,
    pub supports_penalties: bool,
    pub max_stop_sequences: usize,
}

impl Default for ProviderConfigSchema {
    fn default() -> Self {
        Self {
            temperature: 0.0..=2.0,
            top_p: 0.0..=1.0,
            max_tokens_limit: 128_000,
            supports_penalties: true,
            max_stop_sequences: 4,
        }
    }
}

impl ProviderConfigSchema {
    /// 校验参数，失败时返回 `INVALID_REQUEST`
    pub fn validate(&self, config: &ProviderConfig) -> Result<(), LlmError> {
        if let Some(temperature) = config.temperature {
            if !self.temperature.contains(&temperature) {
                return Err(LlmError::invalid_request(format!(
                    "temperature {} 超出范围 {:?}",
                    temperature, self.temperature
                )));
            }
        }

        if let Some(top_p) = config.top_p {
            if !self.top_p.contains(&top_p) {
                return Err(LlmError::invalid_request(format!(
                    "top_p {} 超出范围 {:?}",
                    top_p, self.top_p
                )));
            }
        }

        if let Some(max_tokens) = config.max_tokens {
            if max_tokens == 0 || max_tokens > self.max_tokens_limit {
                return Err(LlmError::invalid_request(format!(
                    "max_tokens {} 必须在 1..={} 之间",
                    max_tokens, self.max_tokens_limit
                )));
            }
        }

        let has_penalty = config.frequency_penalty.is_some() || config.presence_penalty.is_some();
        if has_penalty && !self.supports_penalties {
            return Err(LlmError::invalid_request("该提供商不支持 frequency/presence penalty"));
        }
        for penalty in [config.frequency_penalty, config.presence_penalty].into_iter().flatten() {
            if !(-2.0..=2.0).contains(&penalty) {
                return Err(LlmError::invalid_request(format!(
                    "penalty {} 超出范围 -2.0..=2.0",
                    penalty
                )));
            }
        }

        if let Some(stop) = &config.stop {
            if stop.len() > self.max_stop_sequences {
                return Err(LlmError::invalid_request(format!(
                    "最多支持 {} 个停止序列",
                    self.max_stop_sequences
                )));
            }
        }

        Ok(())
    }
}

/// 单次生成请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// 上一轮的助手输出，作为 assistant 消息插入
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub config: ProviderConfig,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            context: None,
            model: model.into(),
            stream: false,
            config: ProviderConfig::default(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }
}

/// 发往提供商的模型参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// 模型名称（例如：gpt-4o, claude-3-5-sonnet-20241022, llama3.2）
    pub model: String,

    /// 采样温度
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-P 采样
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// 最大输出 token 数，None 表示使用模型默认值
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

impl ModelParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: None,
            stop: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// 按请求参数覆盖默认值
    pub fn from_request(request: &GenerationRequest) -> Self {
        let config = &request.config;
        Self {
            model: request.model.clone(),
            temperature: config.temperature.unwrap_or_else(default_temperature),
            top_p: config.top_p.unwrap_or_else(default_top_p),
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
        }
    }
}

/// Token 使用情况
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// 合并分段上报的用量（Anthropic 在开始和结束事件里分别给出输入/输出）
    pub fn merge(self, other: Usage) -> Usage {
        let prompt_tokens = if other.prompt_tokens > 0 { other.prompt_tokens } else { self.prompt_tokens };
        let completion_tokens = if other.completion_tokens > 0 {
            other.completion_tokens
        } else {
            self.completion_tokens
        };
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: other
                .total_tokens
                .max(self.total_tokens)
                .max(prompt_tokens.saturating_add(completion_tokens)),
        }
    }
}

/// 非流式生成结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub content: String,
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// 流式块的元数据（仅终止块携带）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// 统一的流式响应块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    pub content: String,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChunkMetadata>,
}

impl ResponseChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_complete: false,
            metadata: None,
        }
    }

    pub fn terminal(metadata: ChunkMetadata) -> Self {
        Self {
            content: String::new(),
            is_complete: true,
            metadata: Some(metadata),
        }
    }
}

/// 提供商原生流事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Delta(String),
    Usage(Usage),
    Finish(String),
    Model(String),
}

/// 提供商原生事件流
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

/// 统一后的块流
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ResponseChunk, LlmError>> + Send>>;

/// `generate_text` 的两种结果
pub enum GenerationOutput {
    Text(TextResponse),
    Stream(ChunkStream),
}

impl std::fmt::Debug for GenerationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationOutput::Text(response) => f.debug_tuple("Text").field(response).finish(),
            GenerationOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// 图片生成参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOptions {
    pub model: String,
    /// 例如 "1024x1024"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default = "default_image_count")]
    pub n: u8,
}

fn default_image_count() -> u8 {
    1
}

impl ImageOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            size: None,
            n: default_image_count(),
        }
    }
}

/// 图片生成结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

/// 按 系统 → 上下文(助手) → 用户 的顺序组装消息
pub fn assemble_messages(request: &GenerationRequest) -> Vec<Message> {
    let mut messages = Vec::with_capacity(3);

    if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(Message::system(system));
    }

    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        messages.push(Message::assistant(context));
    }

    messages.push(Message::user(request.prompt.clone()));
    messages
}

/// LLM 服务 Trait
///
/// 必须实现的是提供商钩子；其余方法为所有适配器共享的默认实现。
#[async_trait]
pub trait LLMService: Send + Sync {
    /// 提供商 ID（例如 "openai"、"custom:3f2a..."）
    fn provider_id(&self) -> &str;

    /// 该提供商的模型目录（纯函数，无 I/O）
    fn supported_models(&self) -> Vec<ModelInfo>;

    /// 参数约束
    fn config_schema(&self) -> ProviderConfigSchema {
        ProviderConfigSchema::default()
    }

    /// 是否需要 API Key
    fn requires_api_key(&self) -> bool {
        true
    }

    /// 非流式聊天完成
    async fn chat_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<TextResponse>;

    /// 流式聊天完成，返回提供商原生事件流
    async fn stream_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<ProviderStream>;

    /// 图片生成
    async fn image_generation(
        &self,
        _prompt: &str,
        _options: &ImageOptions,
        _api_key: &SecretString,
    ) -> Result<Vec<ImageResponse>> {
        Err(LlmError::unsupported_operation("generate_image").into())
    }

    fn find_model(&self, model_id: &str) -> Option<ModelInfo> {
        self.supported_models().into_iter().find(|m| m.id == model_id)
    }

    /// 未知模型一律返回 false
    fn supports_capability(&self, model_id: &str, capability: Capability) -> bool {
        self.find_model(model_id)
            .map(|model| model.supports(capability))
            .unwrap_or(false)
    }

    /// 模型存在且具备能力，否则返回 `MODEL_NOT_FOUND` / `UNSUPPORTED_CAPABILITY`
    fn ensure_capability(&self, model_id: &str, capability: Capability) -> Result<ModelInfo, LlmError> {
        let model = self
            .find_model(model_id)
            .ok_or_else(|| LlmError::model_not_found(model_id).with_provider(self.provider_id()))?;

        if !model.supports(capability) {
            return Err(LlmError::unsupported_capability(model_id, capability).with_provider(self.provider_id()));
        }
        Ok(model)
    }

    fn build_messages(&self, request: &GenerationRequest) -> Vec<Message> {
        assemble_messages(request)
    }

    /// 用 1 token 的最小请求验证 API Key，任何失败都返回 false
    async fn validate_api_key(&self, api_key: &SecretString) -> bool {
        let Some(model) = self
            .supported_models()
            .into_iter()
            .find(|m| m.supports(Capability::TextGeneration))
        else {
            return false;
        };

        let params = ModelParams::new(model.id.clone())
            .with_max_tokens(1)
            .with_temperature(0.0);

        match self.chat_completion(vec![Message::user("ping")], params, api_key).await {
            Ok(_) => true,
            Err(e) => {
                let normalized = normalize_error(e);
                log::debug!(
                    "[{}] API Key 验证失败: {} ({})",
                    self.provider_id(),
                    normalized.message,
                    normalized.code
                );
                false
            }
        }
    }

    /// 文本生成：校验 → 组装消息 → 调用提供商 → 归一化结果
    async fn generate_text(
        &self,
        request: GenerationRequest,
        api_key: &SecretString,
    ) -> Result<GenerationOutput, LlmError> {
        if request.prompt.trim().is_empty() {
            return Err(LlmError::invalid_prompt("prompt 不能为空"));
        }

        self.ensure_capability(&request.model, Capability::TextGeneration)?;
        if request.stream {
            self.ensure_capability(&request.model, Capability::Streaming)?;
        }
        self.config_schema().validate(&request.config)?;

        let messages = self.build_messages(&request);
        let params = ModelParams::from_request(&request);
        let provider = self.provider_id().to_string();

        if request.stream {
            let source = self
                .stream_completion(messages, params, api_key)
                .await
                .map_err(|e| attach_provider(normalize_error(e), &provider))?;
            Ok(GenerationOutput::Stream(unify_stream(source, request.model)))
        } else {
            let response = self
                .chat_completion(messages, params, api_key)
                .await
                .map_err(|e| attach_provider(normalize_error(e), &provider))?;
            Ok(GenerationOutput::Text(response))
        }
    }

    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
        api_key: &SecretString,
    ) -> Result<Vec<ImageResponse>, LlmError> {
        if prompt.trim().is_empty() {
            return Err(LlmError::invalid_prompt("prompt 不能为空"));
        }
        self.ensure_capability(&options.model, Capability::ImageGeneration)?;

        self.image_generation(prompt, options, api_key)
            .await
            .map_err(|e| attach_provider(normalize_error(e), self.provider_id()))
    }
}

fn attach_provider(mut error: LlmError, provider: &str) -> LlmError {
    if error.provider.is_none() {
        error.provider = Some(provider.to_string());
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::errors::ErrorCode;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, MessageRole::User);
        assert_eq!(user_msg.content, "Hello");

        let system_msg = Message::system("You are helpful");
        assert_eq!(system_msg.role, MessageRole::System);
    }

    #[test]
    fn test_assemble_messages_order() {
        let request = GenerationRequest::new("gpt-4o", "next question")
            .with_system_prompt("be brief")
            .with_context("previous answer");

        let messages = assemble_messages(&request);
        assert_eq!(
            messages,
            vec![
                Message::system("be brief"),
                Message::assistant("previous answer"),
                Message::user("next question"),
            ]
        );
    }

    #[test]
    fn test_assemble_messages_skips_blank_optionals() {
        let request = GenerationRequest::new("gpt-4o", "hi").with_system_prompt("  ");
        let messages = assemble_messages(&request);
        assert_eq!(messages, vec![Message::user("hi")]);
    }

    #[test]
    fn test_model_params_from_request() {
        let request = GenerationRequest::new("gpt-4o", "hi").with_config(ProviderConfig {
            temperature: Some(0.2),
            max_tokens: Some(256),
            ..Default::default()
        });
        let params = ModelParams::from_request(&request);
        assert_eq!(params.model, "gpt-4o");
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.max_tokens, Some(256));
    }

    #[test]
    fn test_schema_rejects_out_of_range_values() {
        let schema = ProviderConfigSchema {
            temperature: 0.0..=1.0,
            supports_penalties: false,
            ..Default::default()
        };

        let too_hot = ProviderConfig {
            temperature: Some(1.5),
            ..Default::default()
        };
        assert_eq!(schema.validate(&too_hot).unwrap_err().code, ErrorCode::InvalidRequest);

        let penalty = ProviderConfig {
            presence_penalty: Some(0.5),
            ..Default::default()
        };
        assert!(schema.validate(&penalty).is_err());

        let zero_tokens = ProviderConfig {
            max_tokens: Some(0),
            ..Default::default()
        };
        assert!(schema.validate(&zero_tokens).is_err());

        assert!(schema.validate(&ProviderConfig::default()).is_ok());
    }

    #[test]
    fn test_usage_merge() {
        let start = Usage::new(12, 0);
        let end = Usage {
            prompt_tokens: 0,
            completion_tokens: 30,
            total_tokens: 0,
        };
        let merged = start.merge(end);
        assert_eq!(merged, Usage::new(12, 30));
    }

    #[test]
    fn test_usage_saturates_instead_of_overflowing() {
        let huge = Usage::new(u32::MAX, 1);
        assert_eq!(huge.total_tokens, u32::MAX);

        let merged = Usage::new(u32::MAX - 1, 0).merge(Usage::new(0, 5));
        assert_eq!(merged.completion_tokens, 5);
        assert_eq!(merged.total_tokens, u32::MAX);
    }

    /// 复用 OpenAI 客户端的自定义提供商
    struct OpenAiCompatible;

    #[async_trait]
    impl LLMService for OpenAiCompatible {
        fn provider_id(&self) -> &str {
            "custom:local-vllm"
        }

        fn supported_models(&self) -> Vec<ModelInfo> {
            vec![ModelInfo::chat_model("custom:local-vllm")]
        }

        async fn chat_completion(
            &self,
            _messages: Vec<Message>,
            _params: ModelParams,
            _api_key: &SecretString,
        ) -> Result<TextResponse> {
            Err(async_openai::error::OpenAIError::InvalidArgument("bad request".to_string()).into())
        }

        async fn stream_completion(
            &self,
            _messages: Vec<Message>,
            _params: ModelParams,
            _api_key: &SecretString,
        ) -> Result<ProviderStream> {
            anyhow::bail!("not streaming")
        }
    }

    #[tokio::test]
    async fn test_sdk_error_tagged_with_calling_provider() {
        let request = GenerationRequest::new("custom:local-vllm", "hi");
        let key = SecretString::from("sk-test".to_string());
        let err = match OpenAiCompatible.generate_text(request, &key).await {
            Err(err) => err,
            Ok(_) => panic!("expected failure"),
        };
        assert_eq!(err.code, ErrorCode::InvalidPrompt);
        assert_eq!(err.provider.as_deref(), Some("custom:local-vllm"));
    }

    #[test]
    fn test_chunk_wire_shape() {
        let chunk = ResponseChunk::terminal(ChunkMetadata {
            model: "gpt-4o".to_string(),
            usage: None,
            finish_reason: Some("stop".to_string()),
        });
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["isComplete"], true);
        assert_eq!(json["metadata"]["finishReason"], "stop");
        assert_eq!(json["content"], "");
    }

    #[test]
    fn test_generation_request_flattens_config() {
        let request = GenerationRequest::new("m", "p").with_config(ProviderConfig {
            max_tokens: Some(10),
            ..Default::default()
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["max_tokens"], 10);
        assert_eq!(json["model"], "m");
    }
}
