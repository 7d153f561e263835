//! 模型目录
//!
//! 每个内置提供商一份静态模型列表；适配器的 `supported_models()` 直接返回这里的数据，
//! 不做任何网络请求。

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// 模型能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    TextGeneration,
    ImageGeneration,
    Streaming,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TextGeneration => "TEXT_GENERATION",
            Capability::ImageGeneration => "IMAGE_GENERATION",
            Capability::Streaming => "STREAMING",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub text_generation: bool,
    pub image_generation: bool,
    pub streaming: bool,
    /// 上下文窗口（token）
    pub context_length: u32,
}

impl ModelCapabilities {
    pub const fn chat(context_length: u32) -> Self {
        Self {
            text_generation: true,
            image_generation: false,
            streaming: true,
            context_length,
        }
    }

    pub const fn image() -> Self {
        Self {
            text_generation: false,
            image_generation: true,
            streaming: false,
            context_length: 0,
        }
    }
}

/// 每千 token 价格（美元）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_1k_tokens: f64,
    pub output_cost_per_1k_tokens: f64,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64) -> Self {
        Self {
            input_cost_per_1k_tokens: input,
            output_cost_per_1k_tokens: output,
        }
    }

    pub const FREE: ModelPricing = ModelPricing::new(0.0, 0.0);
}

/// 模型描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub capabilities: ModelCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
}

impl ModelInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: ModelCapabilities,
        pricing: Option<ModelPricing>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            capabilities,
            pricing,
        }
    }

    /// 配置文件里追加的模型：只知道 id，按普通聊天模型处理
    pub fn chat_model(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            description: String::new(),
            id,
            capabilities: ModelCapabilities::chat(8_192),
            pricing: None,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::TextGeneration => self.capabilities.text_generation,
            Capability::ImageGeneration => self.capabilities.image_generation,
            Capability::Streaming => self.capabilities.streaming,
        }
    }

    /// 估算费用（美元）
    pub fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> Option<f64> {
        self.pricing.map(|p| {
            prompt_tokens as f64 / 1000.0 * p.input_cost_per_1k_tokens
                + completion_tokens as f64 / 1000.0 * p.output_cost_per_1k_tokens
        })
    }
}

fn chat(id: &str, name: &str, description: &str, context: u32, pricing: ModelPricing) -> ModelInfo {
    ModelInfo::new(id, name, description, ModelCapabilities::chat(context), Some(pricing))
}

pub static OPENAI_MODELS: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        chat("gpt-4o", "GPT-4o", "旗舰多模态模型", 128_000, ModelPricing::new(0.0025, 0.01)),
        chat("gpt-4o-mini", "GPT-4o mini", "低成本快速模型", 128_000, ModelPricing::new(0.00015, 0.0006)),
        chat("gpt-4-turbo", "GPT-4 Turbo", "GPT-4 Turbo", 128_000, ModelPricing::new(0.01, 0.03)),
        chat("gpt-4", "GPT-4", "GPT-4", 8_192, ModelPricing::new(0.03, 0.06)),
        chat("gpt-3.5-turbo", "GPT-3.5 Turbo", "旧版对话模型", 16_385, ModelPricing::new(0.0005, 0.0015)),
        ModelInfo::new("dall-e-3", "DALL·E 3", "图片生成", ModelCapabilities::image(), None),
        ModelInfo::new("dall-e-2", "DALL·E 2", "图片生成", ModelCapabilities::image(), None),
    ]
});

pub static ANTHROPIC_MODELS: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        chat(
            "claude-3-5-sonnet-20241022",
            "Claude 3.5 Sonnet",
            "综合能力最强的 3.5 模型",
            200_000,
            ModelPricing::new(0.003, 0.015),
        ),
        chat(
            "claude-3-5-haiku-20241022",
            "Claude 3.5 Haiku",
            "快速低成本",
            200_000,
            ModelPricing::new(0.0008, 0.004),
        ),
        chat(
            "claude-3-opus-20240229",
            "Claude 3 Opus",
            "复杂任务",
            200_000,
            ModelPricing::new(0.015, 0.075),
        ),
        chat(
            "claude-3-haiku-20240307",
            "Claude 3 Haiku",
            "轻量模型",
            200_000,
            ModelPricing::new(0.00025, 0.00125),
        ),
    ]
});

pub static GOOGLE_MODELS: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        chat("gemini-2.0-flash", "Gemini 2.0 Flash", "新一代快速模型", 1_048_576, ModelPricing::new(0.0001, 0.0004)),
        chat(
            "gemini-2.5-flash-lite",
            "Gemini 2.5 Flash-Lite",
            "低延迟轻量模型",
            1_048_576,
            ModelPricing::new(0.0001, 0.0004),
        ),
        chat("gemini-1.5-pro", "Gemini 1.5 Pro", "长上下文", 2_097_152, ModelPricing::new(0.00125, 0.005)),
        chat("gemini-1.5-flash", "Gemini 1.5 Flash", "快速模型", 1_048_576, ModelPricing::new(0.000075, 0.0003)),
    ]
});

pub static OLLAMA_MODELS: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        chat("llama3.2", "Llama 3.2", "本地运行", 128_000, ModelPricing::FREE),
        chat("llama3.1", "Llama 3.1", "本地运行", 128_000, ModelPricing::FREE),
        chat("mistral", "Mistral 7B", "本地运行", 32_768, ModelPricing::FREE),
        chat("qwen2.5", "Qwen 2.5", "本地运行", 32_768, ModelPricing::FREE),
        chat("codellama", "Code Llama", "本地代码模型", 16_384, ModelPricing::FREE),
    ]
});

/// 内置提供商的静态目录，未知提供商返回空切片
pub fn builtin_models(provider_id: &str) -> &'static [ModelInfo] {
    match provider_id {
        "openai" => &OPENAI_MODELS,
        "anthropic" => &ANTHROPIC_MODELS,
        "google" => &GOOGLE_MODELS,
        "ollama" => &OLLAMA_MODELS,
        _ => &[],
    }
}

/// 目录 + 配置中追加的模型（按 id 去重，内置优先）
pub fn catalog_with_extras(base: &[ModelInfo], extra_models: &[String]) -> Vec<ModelInfo> {
    let mut models = base.to_vec();
    for id in extra_models {
        if !models.iter().any(|m| &m.id == id) {
            models.push(ModelInfo::chat_model(id.clone()));
        }
    }
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ids_unique_per_provider() {
        for provider in ["openai", "anthropic", "google", "ollama"] {
            let models = builtin_models(provider);
            assert!(!models.is_empty(), "{} 目录为空", provider);
            let mut ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), models.len(), "{} 存在重复 id", provider);
        }
    }

    #[test]
    fn test_image_models_do_not_chat() {
        let dalle = OPENAI_MODELS.iter().find(|m| m.id == "dall-e-3").unwrap();
        assert!(dalle.supports(Capability::ImageGeneration));
        assert!(!dalle.supports(Capability::TextGeneration));
        assert!(!dalle.supports(Capability::Streaming));
    }

    #[test]
    fn test_extras_are_appended_once() {
        let extras = vec!["gpt-4o".to_string(), "my-finetune".to_string()];
        let models = catalog_with_extras(&OPENAI_MODELS, &extras);
        assert_eq!(models.len(), OPENAI_MODELS.len() + 1);
        let added = models.last().unwrap();
        assert_eq!(added.id, "my-finetune");
        assert!(added.supports(Capability::TextGeneration));
    }

    #[test]
    fn test_estimate_cost() {
        let model = OPENAI_MODELS.iter().find(|m| m.id == "gpt-4").unwrap();
        let cost = model.estimate_cost(1000, 1000).unwrap();
        assert!((cost - 0.09).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn test_every_listed_model_is_text_or_image(provider in prop::sample::select(vec!["openai", "anthropic", "google", "ollama"])) {
            for model in builtin_models(provider) {
                prop_assert!(
                    model.supports(Capability::TextGeneration) || model.supports(Capability::ImageGeneration)
                );
                if model.supports(Capability::Streaming) {
                    prop_assert!(model.supports(Capability::TextGeneration));
                }
            }
        }

        #[test]
        fn test_unknown_ids_are_absent(id in "[a-z]{3,12}-unknown-[0-9]{1,4}") {
            for provider in ["openai", "anthropic", "google", "ollama"] {
                prop_assert!(!builtin_models(provider).iter().any(|m| m.id == id));
            }
        }
    }
}
