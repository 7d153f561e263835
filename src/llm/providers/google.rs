//! Google Gemini API 提供商
//!
//! 支持 Gemini 2.0 Flash, Gemini 1.5 Pro 等模型（ML Dev API，API Key 认证）

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
use crate::llm::registry::{catalog_with_extras, ModelInfo, GOOGLE_MODELS};
use crate::llm::stream::sse_data_stream;

pub const PROVIDER_ID: &str = "google";

/// Google 提供商客户端
pub struct GoogleProvider {
    /// HTTP 客户端
    client: Client,

    /// 基础 URL，例如 `https://generativelanguage.googleapis.com/v1beta`
    base_url: String,

    models: Vec<ModelInfo>,
}

impl GoogleProvider {
    pub fn new(client: Client, base_url: impl Into<String>, extra_models: &[String]) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            models: catalog_with_extras(&GOOGLE_MODELS, extra_models),
        }
    }

    /// 构建请求体：system 消息进入 systemInstruction，assistant 角色改为 model
    fn build_request(messages: Vec<Message>, params: &ModelParams) -> GeminiRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in messages {
            match msg.role {
                MessageRole::System => system_parts.push(Part { text: msg.content }),
                MessageRole::User => contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![Part { text: msg.content }],
                }),
                MessageRole::Assistant => contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![Part { text: msg.content }],
                }),
            }
        }

        GeminiRequest {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| Content {
                role: None,
                parts: system_parts,
            }),
            generation_config: GenerationConfig {
                temperature: Some(params.temperature),
                top_p: Some(params.top_p),
                max_output_tokens: params.max_tokens,
                stop_sequences: params.stop.clone(),
            },
        }
    }

    async fn post(&self, url: String, request: &GeminiRequest, api_key: &SecretString) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key.expose_secret())
            .json(request)
            .send()
            .await
            .context("发送 Gemini API 请求失败")?;

        HttpStatusError::check(PROVIDER_ID, response)
            .await
            .map_err(Self::refine_error)
    }

    /// Gemini 对无效 Key 返回 400，这里按错误体区分出来
    fn refine_error(err: anyhow::Error) -> anyhow::Error {
        match err.downcast_ref::<HttpStatusError>() {
            Some(http) if http.status == 400 && http.body.contains("API_KEY_INVALID") => {
                LlmError::new(ErrorCode::InvalidApiKey, http.provider_message())
                    .with_status(http.status)
                    .with_provider(PROVIDER_ID)
                    .into()
            }
            _ => err,
        }
    }

    fn text_of(candidate: &Candidate) -> String {
        candidate
            .content
            .as_ref()
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect::<String>())
            .unwrap_or_default()
    }

    /// 流式块转换为原生事件
    fn events_of(chunk: GeminiResponse) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if let Some(version) = chunk.model_version {
            events.push(ProviderEvent::Model(version));
        }
        if let Some(candidate) = chunk.candidates.first() {
            let text = Self::text_of(candidate);
            if !text.is_empty() {
                events.push(ProviderEvent::Delta(text));
            }
            if let Some(reason) = &candidate.finish_reason {
                events.push(ProviderEvent::Finish(reason.to_lowercase()));
            }
        }
        if let Some(usage) = chunk.usage_metadata {
            events.push(ProviderEvent::Usage(usage.into()));
        }
        events
    }
}

#[async_trait]
impl LLMService for GoogleProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn config_schema(&self) -> ProviderConfigSchema {
        ProviderConfigSchema {
            max_tokens_limit: 8_192,
            supports_penalties: false,
            max_stop_sequences: 5,
            ..Default::default()
        }
    }

    async fn chat_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<TextResponse> {
        let request = Self::build_request(messages, &params);
        let url = format!("{}/models/{}:generateContent", self.base_url, params.model);

        let response: GeminiResponse = self
            .post(url, &request, api_key)
            .await?
            .json()
            .await
            .context("解析 Gemini API 响应失败")?;

        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| LlmError::invalid_response("Gemini 返回空响应（可能被安全策略拦截）"))?;

        Ok(TextResponse {
            content: Self::text_of(candidate),
            model: response.model_version.clone().unwrap_or(params.model),
            finish_reason: candidate.finish_reason.as_ref().map(|r| r.to_lowercase()),
            usage: response.usage_metadata.map(Into::into),
        })
    }

    async fn stream_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<ProviderStream> {
        let request = Self::build_request(messages, &params);
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, params.model);
        let response = self.post(url, &request, api_key).await?;
        let mut sse = sse_data_stream(response);

        let events = async_stream::stream! {
            while let Some(item) = sse.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                if event.data.trim().is_empty() {
                    continue;
                }

                let chunk: GeminiResponse = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("解析 Gemini 流式块失败"));
                        return;
                    }
                };
                for parsed in Self::events_of(chunk) {
                    yield Ok(parsed);
                }
            }
        };

        Ok(Box::pin(events))
    }
}

// ========== Gemini API 数据结构 ==========

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<UsageMetadata> for Usage {
    fn from(usage: UsageMetadata) -> Self {
        Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage
                .total_token_count
                .max(usage.prompt_token_count.saturating_add(usage.candidates_token_count)),
        }
    }
}
