//! 用户自定义提供商
//!
//! 复用 OpenAI 或 Anthropic 协议访问任意兼容端点；对外只暴露一个模型 `custom:<id>`，
//! 调用时替换为上游真实模型名。

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::SecretString;

use crate::database::models::{CustomProviderRecord, CustomProviderType};
use crate::llm::interface::{
    ImageOptions, ImageResponse, LLMService, Message, ModelParams, ProviderConfigSchema, ProviderStream,
    TextResponse,
};
use crate::llm::registry::{ModelCapabilities, ModelInfo};

use super::{AnthropicProvider, OpenAIProvider};

pub struct CustomProvider {
    record: Arc<CustomProviderRecord>,
    provider_id: String,
    delegate: Box<dyn LLMService>,
}

impl CustomProvider {
    pub fn new(client: Client, record: Arc<CustomProviderRecord>) -> Self {
        let provider_id = record.provider_id();
        let models = vec![ModelInfo::new(
            provider_id.clone(),
            record.name.clone(),
            format!("{} ({})", record.model, record.base_url),
            ModelCapabilities::chat(128_000),
            None,
        )];

        let delegate: Box<dyn LLMService> = match record.provider_type {
            CustomProviderType::OpenAI => Box::new(OpenAIProvider::compatible(
                client,
                record.base_url.clone(),
                provider_id.clone(),
                models,
            )),
            CustomProviderType::Anthropic => Box::new(AnthropicProvider::compatible(
                client,
                record.base_url.clone(),
                provider_id.clone(),
                models,
            )),
        };

        Self {
            record,
            provider_id,
            delegate,
        }
    }

    pub fn record(&self) -> &CustomProviderRecord {
        &self.record
    }

    fn upstream(&self, mut params: ModelParams) -> ModelParams {
        params.model = self.record.model.clone();
        params
    }
}

#[async_trait]
impl LLMService for CustomProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        self.delegate.supported_models()
    }

    fn config_schema(&self) -> ProviderConfigSchema {
        self.delegate.config_schema()
    }

    async fn chat_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<TextResponse> {
        self.delegate
            .chat_completion(messages, self.upstream(params), api_key)
            .await
    }

    async fn stream_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        api_key: &SecretString,
    ) -> Result<ProviderStream> {
        self.delegate
            .stream_completion(messages, self.upstream(params), api_key)
            .await
    }

    async fn image_generation(
        &self,
        prompt: &str,
        options: &ImageOptions,
        api_key: &SecretString,
    ) -> Result<Vec<ImageResponse>> {
        self.delegate.image_generation(prompt, options, api_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::registry::Capability;

    fn provider(kind: CustomProviderType) -> CustomProvider {
        let record = CustomProviderRecord::new("My Proxy", "https://proxy.local/v1/", kind, "gpt-4o-mini");
        CustomProvider::new(Client::new(), Arc::new(record))
    }

    #[test]
    fn test_single_model_named_after_provider() {
        let provider = provider(CustomProviderType::OpenAI);
        let models = provider.supported_models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, provider.provider_id());
        assert_eq!(models[0].name, "My Proxy");
        assert!(provider.supports_capability(provider.provider_id(), Capability::Streaming));
        assert!(!provider.supports_capability(provider.provider_id(), Capability::ImageGeneration));
    }

    #[test]
    fn test_upstream_model_substituted() {
        let provider = provider(CustomProviderType::Anthropic);
        let params = provider.upstream(ModelParams::new(provider.provider_id()));
        assert_eq!(params.model, "gpt-4o-mini");
        assert_eq!(provider.record().base_url, "https://proxy.local/v1");
    }

    #[test]
    fn test_anthropic_flavor_inherits_schema() {
        let provider = provider(CustomProviderType::Anthropic);
        assert!(!provider.config_schema().supports_penalties);
        assert!(provider.requires_api_key());
    }
}
