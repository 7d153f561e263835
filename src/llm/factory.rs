//! 适配器注册表
//!
//! 按提供商 ID 分发到对应的工厂，实例按 ID 缓存；自定义提供商由记录动态注册。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::config::{AppConfig, ProviderSettings};
use crate::database::models::CustomProviderRecord;
use crate::llm::errors::{ErrorCode, LlmError};
use crate::llm::interface::LLMService;
use crate::llm::model_resolver::{is_custom_id, ProviderKind};
use crate::llm::providers::{
    http_client, AnthropicProvider, CustomProvider, GoogleProvider, OllamaProvider, OpenAIProvider,
};
use crate::llm::registry::ModelInfo;

/// 由设置创建一个适配器
pub trait AdapterFactory: Send + Sync {
    fn create(&self, http: &reqwest::Client, settings: &ProviderSettings) -> Result<Arc<dyn LLMService>>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&reqwest::Client, &ProviderSettings) -> Result<Arc<dyn LLMService>> + Send + Sync,
{
    fn create(&self, http: &reqwest::Client, settings: &ProviderSettings) -> Result<Arc<dyn LLMService>> {
        self(http, settings)
    }
}

pub struct AdapterRegistry {
    http: reqwest::Client,
    factories: HashMap<String, Box<dyn AdapterFactory>>,
    settings: HashMap<String, ProviderSettings>,
    instances: Mutex<HashMap<String, Arc<dyn LLMService>>>,
}

impl AdapterRegistry {
    /// 空注册表
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            factories: HashMap::new(),
            settings: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// 注册四个内置提供商，并应用配置中的覆盖
    pub fn with_builtin_providers(config: &AppConfig) -> Result<Self> {
        let http = http_client(config.request.connect_timeout())?;
        let mut registry = Self::new(http);
        registry.settings = config.providers.clone();

        registry.register_factory(ProviderKind::OpenAI.as_str(), create_openai);
        registry.register_factory(ProviderKind::Anthropic.as_str(), create_anthropic);
        registry.register_factory(ProviderKind::Google.as_str(), create_google);
        registry.register_factory(ProviderKind::Ollama.as_str(), create_ollama);

        Ok(registry)
    }

    pub fn register_factory(&mut self, provider_id: &str, factory: impl AdapterFactory + 'static) {
        self.factories.insert(provider_id.to_string(), Box::new(factory));
        self.lock_instances().remove(provider_id);
    }

    /// 直接注册一个已创建的适配器（覆盖同 ID 的缓存）
    pub fn register_adapter(&self, adapter: Arc<dyn LLMService>) {
        let id = adapter.provider_id().to_string();
        self.lock_instances().insert(id, adapter);
    }

    /// 为自定义提供商记录注册适配器
    pub fn register_custom(&self, record: CustomProviderRecord) -> Arc<dyn LLMService> {
        let adapter: Arc<dyn LLMService> = Arc::new(CustomProvider::new(self.http.clone(), Arc::new(record)));
        self.register_adapter(adapter.clone());
        adapter
    }

    pub fn unregister(&self, provider_id: &str) -> bool {
        self.lock_instances().remove(provider_id).is_some()
    }

    /// 按 ID 取适配器，首次访问时由工厂创建
    pub fn adapter(&self, provider_id: &str) -> Result<Arc<dyn LLMService>, LlmError> {
        if let Some(adapter) = self.lock_instances().get(provider_id) {
            return Ok(adapter.clone());
        }

        let factory = self.factories.get(provider_id).ok_or_else(|| {
            LlmError::new(
                ErrorCode::UnsupportedOperation,
                format!("未注册的提供商: {}", provider_id),
            )
            .with_provider(provider_id)
        })?;

        let settings = self.settings.get(provider_id).cloned().unwrap_or_default();
        let adapter = factory.create(&self.http, &settings).map_err(|e| {
            LlmError::new(ErrorCode::UnknownError, format!("创建 {} 适配器失败: {:#}", provider_id, e))
                .with_provider(provider_id)
        })?;

        log::debug!("已创建适配器: {}", provider_id);
        let adapter = self
            .lock_instances()
            .entry(provider_id.to_string())
            .or_insert(adapter)
            .clone();
        Ok(adapter)
    }

    /// 提供商的模型目录是否包含该模型
    pub fn knows_model(&self, provider_id: &str, model_id: &str) -> bool {
        self.adapter(provider_id)
            .map(|adapter| adapter.find_model(model_id).is_some())
            .unwrap_or(false)
    }

    pub fn models(&self, provider_id: &str) -> Result<Vec<ModelInfo>, LlmError> {
        Ok(self.adapter(provider_id)?.supported_models())
    }

    /// 已知的提供商 ID：内置在前，自定义在后
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.extend(self.lock_instances().keys().cloned());
        ids.sort_by_key(|id| (is_custom_id(id), builtin_rank(id), id.clone()));
        ids.dedup();
        ids
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn LLMService>>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn create_openai(http: &reqwest::Client, s: &ProviderSettings) -> Result<Arc<dyn LLMService>> {
    let base_url = base_url_for(ProviderKind::OpenAI, s);
    Ok(Arc::new(OpenAIProvider::new(http.clone(), base_url, &s.extra_models)))
}

fn create_anthropic(http: &reqwest::Client, s: &ProviderSettings) -> Result<Arc<dyn LLMService>> {
    let base_url = base_url_for(ProviderKind::Anthropic, s);
    Ok(Arc::new(AnthropicProvider::new(http.clone(), base_url, &s.extra_models)))
}

fn create_google(http: &reqwest::Client, s: &ProviderSettings) -> Result<Arc<dyn LLMService>> {
    let base_url = base_url_for(ProviderKind::Google, s);
    Ok(Arc::new(GoogleProvider::new(http.clone(), base_url, &s.extra_models)))
}

fn create_ollama(http: &reqwest::Client, s: &ProviderSettings) -> Result<Arc<dyn LLMService>> {
    let base_url = base_url_for(ProviderKind::Ollama, s);
    Ok(Arc::new(OllamaProvider::new(http.clone(), base_url, &s.extra_models)))
}

fn base_url_for(kind: ProviderKind, settings: &ProviderSettings) -> String {
    settings
        .base_url
        .clone()
        .or_else(|| kind.default_base_url().map(str::to_string))
        .unwrap_or_default()
}

fn builtin_rank(id: &str) -> usize {
    ProviderKind::BUILTIN
        .iter()
        .position(|kind| kind.as_str() == id)
        .unwrap_or(ProviderKind::BUILTIN.len())
}
