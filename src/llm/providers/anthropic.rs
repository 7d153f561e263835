//! Anthropic Claude API 提供商
//!
//! 支持 Claude 3.5, Claude 3 等模型（Messages API）

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::llm::errors::{ErrorCode, HttpStatusError, LlmError};
use crate::llm::interface::{
    LLMService, Message, MessageRole, ModelParams, ProviderConfigSchema, ProviderEvent, ProviderStream,
    TextResponse, Usage,
};
use crate::llm::registry::{catalog_with_extras, ModelInfo, ANTHROPIC_MODELS};
use crate::llm::stream::sse_data_stream;

pub const PROVIDER_ID: &str = "anthropic";

/// Anthropic API 版本
const API_VERSION: &str = "2023-06-01";

/// 未指定 max_tokens 时的默认值（Anthropic 要求必填）
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic 提供商客户端
pub struct AnthropicProvider {
    /// HTTP 客户端
    client: Client,

    /// 基础 URL
    base_url: String,

    provider_id: String,

    models: Vec<ModelInfo>,
}

impl AnthropicProvider {
    /// 创建新的 Anthropic 提供商
    ///
    /// # 参数
    /// - `client`: HTTP 客户端
    /// - `base_url`: API 基础 URL，例如 `https://api.anthropic.com`
    /// - `extra_models`: 配置文件中追加的模型
    pub fn new(client: Client, base_url: impl Into<String>, extra_models: &[String]) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_id: PROVIDER_ID.to_string(),
            models: catalog_with_extras(&ANTHROPIC_MODELS, extra_models),
        }
    }

    /// 以其他 ID 与模型目录复用 Anthropic 协议（自定义提供商）
    pub fn compatible(
        client: Client,
        base_url: impl Into<String>,
        provider_id: impl Into<String>,
        models: Vec<ModelInfo>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_id: provider_id.into(),
            models,
        }
    }

    /// 将通用 Message 转换为 Anthropic 格式（system 消息单独处理）
    fn convert_message(msg: Message) -> AnthropicMessage {
        let role = match msg.role {
            MessageRole::Assistant => "assistant",
            MessageRole::User | MessageRole::System => "user",
        };
        AnthropicMessage {
            role: role.to_string(),
            content: vec![ContentBlock::Text { text: msg.content }],
        }
    }

    /// 构建请求体
    fn build_request(messages: Vec<Message>, params: ModelParams, stream: bool) -> AnthropicRequest {
        // 分离系统消息
        let system_messages: Vec<String> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.clone())
            .collect();

        let system = if system_messages.is_empty() {
            None
        } else {
            Some(system_messages.join("\n\n"))
        };

        let anthropic_messages: Vec<AnthropicMessage> = messages
            .into_iter()
            .filter(|m| m.role != MessageRole::System)
            .map(Self::convert_message)
            .collect();

        AnthropicRequest {
            model: params.model,
            messages: anthropic_messages,
            system,
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: Some(params.temperature),
            // 默认值不发送，避免与 temperature 同时设置
            top_p: (params.top_p < 1.0).then_some(params.top_p),
            stop_sequences: params.stop,
            is_stream: stream,
        }
    }

    async fn post(&self, request: &AnthropicRequest, api_key: &SecretString) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .context("发送 Anthropic API 请求失败")?;

        HttpStatusError::check(&self.provider_id, response).await
    }

    /// 流式 error 事件中的错误类型
    fn error_code_for(error_type: &str) -> ErrorCode {
        match error_type {
            "invalid_request_error" => ErrorCode::InvalidRequest,
            "authentication_error" => ErrorCode::InvalidApiKey,
            "permission_error" => ErrorCode::PermissionDenied,
            "not_found_error" => ErrorCode::ModelNotFound,
            "rate_limit_error" => ErrorCode::RateLimitExceeded,
            "overloaded_error" | "api_error" => ErrorCode::ServiceUnavailable,
            _ => ErrorCode::ApiCallError,
        }
    }

    /// 解析单个 SSE 事件
    fn parse_event(provider: &str, data: &str) -> Result<Vec<ProviderEvent>> {
        let event: StreamEvent = serde_json::from_str(data).context("解析 Anthropic 流式事件失败")?;

        let events = match event {
            StreamEvent::MessageStart { message } => {
                let mut events = vec![ProviderEvent::Model(message.model)];
                if let Some(usage) = message.usage {
                    events.push(ProviderEvent::Usage(usage.into()));
                }
                events
            }
            StreamEvent::ContentBlockDelta { delta } => match delta.text {
                Some(text) => vec![ProviderEvent::Delta(text)],
                None => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let mut events = Vec::new();
                if let Some(usage) = usage {
                    events.push(ProviderEvent::Usage(usage.into()));
                }
                if let Some(reason) = delta.stop_reason {
                    events.push(ProviderEvent::Finish(reason));
                }
                events
            }
            StreamEvent::Error { error } => {
                return Err(LlmError::new(Self::error_code_for(&error.type_), error.message)
                    .with_provider(provider)
                    .into());
            }
            StreamEvent::MessageStop | StreamEvent::Other => Vec::new(),
        };

        Ok(events)
    }
}

#[async_trait]
impl LLMService for AnthropicProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn config_schema(&self) -> ProviderConfigSchema {
        ProviderConfigSchema {
            temperature: 0.0..=1.0,
            max_tokens_limit: 8_192,
            supports_penalties: false,
            max_stop_sequences: 8,
            ..Default::default()
        }
    }

    async fn chat_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<TextResponse> {
        let request = Self::build_request(messages, params, false);
        let response: AnthropicResponse = self
            .post(&request, api_key)
            .await?
            .json()
            .await
            .context("解析 Anthropic API 响应失败")?;

        let content = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(TextResponse {
            content,
            model: response.model,
            finish_reason: response.stop_reason,
            usage: response.usage.map(Into::into),
        })
    }

    async fn stream_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<ProviderStream> {
        let request = Self::build_request(messages, params, true);
        let response = self.post(&request, api_key).await?;
        let mut sse = sse_data_stream(response);
        let provider = self.provider_id.clone();

        let events = async_stream::stream! {
            while let Some(item) = sse.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                if event.event == "ping" || event.data.trim().is_empty() {
                    continue;
                }

                match Self::parse_event(&provider, &event.data) {
                    Ok(parsed) => {
                        for parsed_event in parsed {
                            yield Ok(parsed_event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }

                if event.event == "message_stop" {
                    break;
                }
            }
        };

        Ok(Box::pin(events))
    }
}

// ========== Anthropic API 数据结构 ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

/// 内容块
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(rename = "stream")]
    is_stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl From<AnthropicUsage> for Usage {
    fn from(usage: AnthropicUsage) -> Self {
        Usage::new(usage.input_tokens, usage.output_tokens)
    }
}

/// 流式事件
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockDelta {
        delta: TextDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    /// ping、content_block_start/stop 等
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    model: String,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct TextDelta {
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamError {
    #[serde(rename = "type")]
    type_: String,
    message: String,
}
