//! Ollama 本地 LLM 服务提供商
//!
//! 通过 Ollama 的 OpenAI 兼容端点访问本地模型，无需 API Key

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::llm::errors::{HttpStatusError, LlmError};
use crate::llm::interface::{
    LLMService, Message, MessageRole, ModelParams, ProviderEvent, ProviderStream, TextResponse, Usage,
};
use crate::llm::registry::{catalog_with_extras, ModelInfo, OLLAMA_MODELS};
use crate::llm::stream::sse_data_stream;

pub const PROVIDER_ID: &str = "ollama";

/// Ollama 提供商客户端
pub struct OllamaProvider {
    /// HTTP 客户端
    client: Client,

    /// 基础 URL
    base_url: String,

    models: Vec<ModelInfo>,
}

impl OllamaProvider {
    /// 创建新的 Ollama 提供商
    ///
    /// # 参数
    /// - `base_url`: Ollama 服务地址，例如 `http://localhost:11434`
    /// - `extra_models`: 本地已拉取、但不在内置目录中的模型
    pub fn new(client: Client, base_url: impl Into<String>, extra_models: &[String]) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            models: catalog_with_extras(&OLLAMA_MODELS, extra_models),
        }
    }

    /// 将通用 Message 转换为 Ollama 格式
    fn convert_message(msg: Message) -> OllamaMessage {
        OllamaMessage {
            role: match msg.role {
                MessageRole::System => "system".to_string(),
                MessageRole::User => "user".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
            },
            content: msg.content,
        }
    }

    /// 构建请求体
    fn build_request(messages: Vec<Message>, params: ModelParams, stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: params.model,
            messages: messages.into_iter().map(Self::convert_message).collect(),
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            stop: params.stop,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
        }
    }

    async fn post(&self, request: &OllamaRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("发送 Ollama API 请求失败")?;

        HttpStatusError::check(PROVIDER_ID, response).await
    }

    /// 解析一个流式块；`[DONE]` 返回空列表
    fn parse_chunk(data: &str) -> Result<Vec<ProviderEvent>> {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(Vec::new());
        }

        let chunk: OllamaStreamResponse = serde_json::from_str(data).context("解析 Ollama 流式块失败")?;
        let mut events = Vec::new();
        if let Some(model) = chunk.model {
            events.push(ProviderEvent::Model(model));
        }
        if let Some(choice) = chunk.choices.first() {
            if let Some(content) = choice.delta.content.as_ref().filter(|c| !c.is_empty()) {
                events.push(ProviderEvent::Delta(content.clone()));
            }
            if let Some(reason) = &choice.finish_reason {
                events.push(ProviderEvent::Finish(reason.clone()));
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(ProviderEvent::Usage(usage.into()));
        }
        Ok(events)
    }
}

#[async_trait]
impl LLMService for OllamaProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn requires_api_key(&self) -> bool {
        false
    }

    async fn chat_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        _api_key: &SecretString,
    ) -> Result<TextResponse> {
        let request = Self::build_request(messages, params, false);
        let response: OllamaResponse = self
            .post(&request)
            .await?
            .json()
            .await
            .context("解析 Ollama API 响应失败")?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::invalid_response("Ollama 返回空响应"))?;

        Ok(TextResponse {
            content: choice.message.content,
            model: response.model,
            finish_reason: choice.finish_reason,
            usage: response.usage.map(Into::into),
        })
    }

    async fn stream_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        _api_key: &SecretString,
    ) -> Result<ProviderStream> {
        let request = Self::build_request(messages, params, true);
        let response = self.post(&request).await?;
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
                if event.data.trim() == "[DONE]" {
                    break;
                }
                match Self::parse_chunk(&event.data) {
                    Ok(parsed) => {
                        for e in parsed {
                            yield Ok(e);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(events))
    }
}

// ========== Ollama API 数据结构 ==========

/// Ollama 消息
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Ollama 请求（OpenAI 兼容格式）
#[derive(Debug, Clone, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
}

/// Ollama 非流式响应
#[derive(Debug, Clone, Deserialize)]
struct OllamaResponse {
    model: String,
    #[serde(default)]
    choices: Vec<OllamaChoice>,
    usage: Option<OllamaUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaChoice {
    message: OllamaMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct OllamaUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<OllamaUsage> for Usage {
    fn from(usage: OllamaUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

/// Ollama 流式响应
#[derive(Debug, Clone, Deserialize)]
struct OllamaStreamResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OllamaStreamChoice>,
    usage: Option<OllamaUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaStreamChoice {
    delta: OllamaDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_api_key_required() {
        let provider = OllamaProvider::new(Client::new(), "http://localhost:11434/", &[]);
        assert!(!provider.requires_api_key());
        assert_eq!(provider.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_extra_models_appended() {
        let provider = OllamaProvider::new(Client::new(), "http://localhost:11434", &["qwen2.5:7b".to_string()]);
        assert!(provider.find_model("qwen2.5:7b").is_some());
        assert!(provider.find_model("llama3.2").is_some());
    }

    #[test]
    fn test_stream_request_asks_for_usage() {
        let request = OllamaProvider::build_request(
            vec![Message::system("sys"), Message::user("hi")],
            ModelParams::new("llama3.2"),
            true,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_parse_chunks() {
        let events = OllamaProvider::parse_chunk(
            r#"{"model":"llama3.2","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![ProviderEvent::Model("llama3.2".into()), ProviderEvent::Delta("Hi".into())]
        );

        let events = OllamaProvider::parse_chunk(
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![ProviderEvent::Finish("stop".into()), ProviderEvent::Usage(Usage::new(3, 1))]
        );

        assert!(OllamaProvider::parse_chunk("[DONE]").unwrap().is_empty());
        assert!(OllamaProvider::parse_chunk("{not json").is_err());
    }
}
