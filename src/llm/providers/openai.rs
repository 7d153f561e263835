//! OpenAI 兼容 API 提供商
//!
//! 支持 OpenAI 官方 API 及兼容接口（OneAPI、中转服务等），包括 DALL·E 图片生成

use anyhow::{Context, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, ChatCompletionStreamOptions, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, CreateImageRequestArgs, FinishReason, Image, ImageModel,
        ImageResponseFormat, ImageSize,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use crate::llm::errors::LlmError;
use crate::llm::interface::{
    ImageOptions, ImageResponse, LLMService, Message, MessageRole, ModelParams, ProviderEvent,
    ProviderStream, TextResponse, Usage,
};
use crate::llm::registry::{catalog_with_extras, ModelInfo, OPENAI_MODELS};

pub const PROVIDER_ID: &str = "openai";

/// OpenAI 提供商
pub struct OpenAIProvider {
    /// 共享 HTTP 客户端
    http: reqwest::Client,

    /// 基础 URL（用于自定义 endpoint）
    base_url: String,

    provider_id: String,

    models: Vec<ModelInfo>,
}

impl OpenAIProvider {
    /// 创建新的 OpenAI 提供商
    ///
    /// # 参数
    /// - `http`: HTTP 客户端
    /// - `base_url`: API 基础 URL，例如 `https://api.openai.com/v1`
    /// - `extra_models`: 配置文件中追加的模型
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, extra_models: &[String]) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_id: PROVIDER_ID.to_string(),
            models: catalog_with_extras(&OPENAI_MODELS, extra_models),
        }
    }

    /// 以其他 ID 与模型目录复用 OpenAI 协议（自定义提供商）
    pub fn compatible(
        http: reqwest::Client,
        base_url: impl Into<String>,
        provider_id: impl Into<String>,
        models: Vec<ModelInfo>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_id: provider_id.into(),
            models,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 每次调用用当前 Key 构建客户端，适配器本身不持有密钥
    fn client(&self, api_key: &SecretString) -> Client<OpenAIConfig> {
        let config = OpenAIConfig::new()
            .with_api_key(api_key.expose_secret())
            .with_api_base(&self.base_url);

        Client::with_config(config).with_http_client(self.http.clone())
    }

    /// 将通用 Message 转换为 OpenAI 格式
    fn convert_messages(messages: Vec<Message>) -> Vec<ChatCompletionRequestMessage> {
        messages
            .into_iter()
            .map(|msg| match msg.role {
                MessageRole::System => {
                    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                        content: ChatCompletionRequestSystemMessageContent::Text(msg.content),
                        name: None,
                    })
                }
                MessageRole::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    content: ChatCompletionRequestUserMessageContent::Text(msg.content),
                    name: None,
                }),
                MessageRole::Assistant => {
                    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                        content: Some(ChatCompletionRequestAssistantMessageContent::Text(msg.content)),
                        name: None,
                        tool_calls: None,
                        refusal: None,
                        function_call: None,
                    })
                }
            })
            .collect()
    }

    /// 将通用参数转换为 OpenAI 请求
    fn build_request(
        messages: Vec<Message>,
        params: ModelParams,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&params.model)
            .messages(Self::convert_messages(messages))
            .temperature(params.temperature)
            .top_p(params.top_p);

        if let Some(max_tokens) = params.max_tokens {
            builder.max_tokens(max_tokens);
        }
        if let Some(stop) = params.stop {
            builder.stop(stop);
        }
        if let Some(presence_penalty) = params.presence_penalty {
            builder.presence_penalty(presence_penalty);
        }
        if let Some(frequency_penalty) = params.frequency_penalty {
            builder.frequency_penalty(frequency_penalty);
        }
        if stream {
            builder.stream_options(ChatCompletionStreamOptions { include_usage: true });
        }

        builder.build().context("创建 OpenAI 请求失败")
    }

    /// 转换 finish reason
    fn convert_finish_reason(reason: &Option<FinishReason>) -> Option<String> {
        reason.as_ref().map(|r| {
            match r {
                FinishReason::Stop => "stop",
                FinishReason::Length => "length",
                FinishReason::ContentFilter => "content_filter",
                FinishReason::ToolCalls => "tool_calls",
                _ => "other",
            }
            .to_string()
        })
    }

    fn parse_image_size(size: Option<&str>) -> Result<ImageSize, LlmError> {
        match size.unwrap_or("1024x1024") {
            "256x256" => Ok(ImageSize::S256x256),
            "512x512" => Ok(ImageSize::S512x512),
            "1024x1024" => Ok(ImageSize::S1024x1024),
            "1792x1024" => Ok(ImageSize::S1792x1024),
            "1024x1792" => Ok(ImageSize::S1024x1792),
            other => Err(LlmError::invalid_request(format!("不支持的图片尺寸: {}", other))),
        }
    }
}

#[async_trait]
impl LLMService for OpenAIProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn chat_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<TextResponse> {
        let request = Self::build_request(messages, params, false)?;

        let response = self
            .client(api_key)
            .chat()
            .create(request)
            .await
            .context("OpenAI API 请求失败")?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| LlmError::invalid_response("OpenAI 返回空响应"))?;

        Ok(TextResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            model: response.model.clone(),
            finish_reason: Self::convert_finish_reason(&choice.finish_reason),
            usage: response
                .usage
                .as_ref()
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }

    async fn stream_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<ProviderStream> {
        let request = Self::build_request(messages, params, true)?;

        let mut stream = self
            .client(api_key)
            .chat()
            .create_stream(request)
            .await
            .context("OpenAI 流式请求失败")?;

        let events = async_stream::stream! {
            let mut model_reported = false;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("OpenAI 流式响应错误"));
                        return;
                    }
                };

                if !model_reported && !chunk.model.is_empty() {
                    model_reported = true;
                    yield Ok(ProviderEvent::Model(chunk.model.clone()));
                }

                if let Some(choice) = chunk.choices.first() {
                    if let Some(content) = &choice.delta.content {
                        yield Ok(ProviderEvent::Delta(content.clone()));
                    }
                    if let Some(reason) = Self::convert_finish_reason(&choice.finish_reason) {
                        yield Ok(ProviderEvent::Finish(reason));
                    }
                }

                // include_usage 时最后一个块只有 usage，没有 choices
                if let Some(usage) = &chunk.usage {
                    yield Ok(ProviderEvent::Usage(Usage::new(usage.prompt_tokens, usage.completion_tokens)));
                }
            }
        };

        Ok(Box::pin(events))
    }

    async fn image_generation(
        &self,
        prompt: &str,
        options: &ImageOptions,
        api_key: &SecretString,
    ) -> Result<Vec<ImageResponse>> {
        let model = match options.model.as_str() {
            "dall-e-3" => ImageModel::DallE3,
            "dall-e-2" => ImageModel::DallE2,
            other => ImageModel::Other(other.to_string()),
        };

        let request = CreateImageRequestArgs::default()
            .prompt(prompt)
            .model(model)
            .n(options.n.max(1))
            .size(Self::parse_image_size(options.size.as_deref())?)
            .response_format(ImageResponseFormat::Url)
            .build()
            .context("创建图片请求失败")?;

        let response = self
            .client(api_key)
            .images()
            .create(request)
            .await
            .context("OpenAI 图片生成失败")?;

        Ok(response
            .data
            .iter()
            .map(|image| match image.as_ref() {
                Image::Url { url, revised_prompt } => ImageResponse {
                    url: Some(url.clone()),
                    b64_json: None,
                    revised_prompt: revised_prompt.clone(),
                },
                Image::B64Json {
                    b64_json,
                    revised_prompt,
                } => ImageResponse {
                    url: None,
                    b64_json: Some(b64_json.to_string()),
                    revised_prompt: revised_prompt.clone(),
                },
            })
            .collect())
    }
}
