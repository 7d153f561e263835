//! 模型 ID 解析器
//!
//! 支持两种模型 ID 格式：
//! - 命名空间格式：`provider:model` (如 `openai:gpt-4o`)，自定义提供商为 `custom:<id>`
//! - 传统格式：`model` (与请求的提供商列表做交叉，按模型目录过滤)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 模型分隔符
const MODEL_SEPARATOR: &str = ":";

/// 自定义提供商前缀
pub const CUSTOM_PREFIX: &str = "custom";

/// 内置提供商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Google,
    Ollama,
    Custom,
}

impl ProviderKind {
    /// 内置（非自定义）提供商
    pub const BUILTIN: [ProviderKind; 4] = [
        ProviderKind::OpenAI,
        ProviderKind::Anthropic,
        ProviderKind::Google,
        ProviderKind::Ollama,
    ];

    /// 解析提供商类型字符串（不区分大小写，支持别名）
    pub fn parse(provider_str: &str) -> Result<Self> {
        match provider_str.trim().to_lowercase().as_str() {
            "openai" | "oai" => Ok(ProviderKind::OpenAI),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "ollama" => Ok(ProviderKind::Ollama),
            "custom" => Ok(ProviderKind::Custom),
            _ => anyhow::bail!("未知的提供商类型: '{}'", provider_str),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Custom => CUSTOM_PREFIX,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::Google => "Google Gemini",
            ProviderKind::Ollama => "Ollama",
            ProviderKind::Custom => "Custom",
        }
    }

    /// 默认 API 地址，自定义提供商没有默认值
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAI => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com"),
            ProviderKind::Google => Some("https://generativelanguage.googleapis.com/v1beta"),
            ProviderKind::Ollama => Some("http://localhost:11434"),
            ProviderKind::Custom => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个 (提供商, 模型) 目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// 规范化的提供商 ID；自定义提供商为 `custom:<id>`
    pub provider: String,
    pub model: String,
}

impl Target {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// 自定义提供商只有一个模型，模型 ID 与提供商 ID 相同
    pub fn custom(record_id: &str) -> Self {
        let id = custom_provider_id(record_id);
        Self {
            provider: id.clone(),
            model: id,
        }
    }

    pub fn is_custom(&self) -> bool {
        is_custom_id(&self.provider)
    }

    /// 对话内唯一的目标键
    pub fn key(&self) -> String {
        if self.is_custom() {
            self.provider.clone()
        } else {
            ModelResolver::build_model_id(&self.provider, &self.model)
        }
    }

    /// 保险库中凭证的名称
    pub fn credential_name(&self) -> &str {
        &self.provider
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn custom_provider_id(record_id: &str) -> String {
    format!("{}{}{}", CUSTOM_PREFIX, MODEL_SEPARATOR, record_id)
}

pub fn is_custom_id(id: &str) -> bool {
    id.strip_prefix(CUSTOM_PREFIX)
        .and_then(|rest| rest.strip_prefix(MODEL_SEPARATOR))
        .map(|rest| !rest.is_empty())
        .unwrap_or(false)
}

/// 模型解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    /// 规范化的提供商 ID（如果明确指定）
    pub provider: Option<String>,
    /// 实际的模型 ID（不含提供商前缀）
    pub model_id: String,
}

/// 模型 ID 解析器
pub struct ModelResolver;

impl ModelResolver {
    /// 解析模型 ID
    ///
    /// # 示例
    /// ```ignore
    /// let resolved = ModelResolver::resolve("claude:claude-3-5-haiku-20241022")?;
    /// assert_eq!(resolved.provider.as_deref(), Some("anthropic"));
    ///
    /// let resolved = ModelResolver::resolve("gpt-4o")?;
    /// assert_eq!(resolved.provider, None);
    /// ```
    pub fn resolve(model_id: &str) -> Result<ResolvedModel> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            anyhow::bail!("模型 ID 不能为空");
        }

        if Self::is_namespaced(model_id) {
            Self::resolve_namespaced(model_id)
        } else {
            Ok(ResolvedModel {
                provider: None,
                model_id: model_id.to_string(),
            })
        }
    }

    /// 格式: `provider:model` 或 `custom:<id>`
    fn resolve_namespaced(model_id: &str) -> Result<ResolvedModel> {
        let (provider_str, actual_model_id) = model_id
            .split_once(MODEL_SEPARATOR)
            .with_context(|| format!("无效的模型 ID 格式: '{}'", model_id))?;

        if actual_model_id.is_empty() {
            anyhow::bail!("无效的模型 ID 格式: '{}', 期望格式: 'provider:model'", model_id);
        }

        let kind = ProviderKind::parse(provider_str)
            .with_context(|| format!("无法解析提供商类型: '{}'", provider_str))?;

        if kind == ProviderKind::Custom {
            let id = custom_provider_id(actual_model_id);
            return Ok(ResolvedModel {
                provider: Some(id.clone()),
                model_id: id,
            });
        }

        Ok(ResolvedModel {
            provider: Some(kind.as_str().to_string()),
            model_id: actual_model_id.to_string(),
        })
    }

    /// 规范化提供商 ID：别名转为标准名，`custom:<id>` 原样保留
    pub fn canonical_provider(provider: &str) -> Result<String> {
        let provider = provider.trim();
        if is_custom_id(provider) {
            return Ok(provider.to_string());
        }
        let kind = ProviderKind::parse(provider)?;
        if kind == ProviderKind::Custom {
            anyhow::bail!("自定义提供商需要写成 'custom:<id>'");
        }
        Ok(kind.as_str().to_string())
    }

    /// 构建完整的模型 ID（带提供商前缀）
    pub fn build_model_id(provider: &str, model_id: &str) -> String {
        format!("{}{}{}", provider, MODEL_SEPARATOR, model_id)
    }

    /// 分隔符前是已知提供商（或别名）时才算命名空间格式
    ///
    /// Ollama 的 `qwen2.5:7b` 这类标签本身带 `:`，按传统模型处理
    pub fn is_namespaced(model_id: &str) -> bool {
        model_id
            .split_once(MODEL_SEPARATOR)
            .is_some_and(|(prefix, _)| ProviderKind::parse(prefix).is_ok())
    }
}

/// 由请求的提供商与模型计算目标列表
///
/// - 命名空间模型在其提供商被请求（或未指定任何提供商）时保留
/// - 传统模型与每个请求的提供商交叉，仅保留 `knows(provider, model)` 为真的组合
/// - 请求了自定义提供商但没有模型指向它时，加入其唯一模型
/// - 去重，保持顺序；结果为空时报错
pub fn resolve_targets<F>(providers: &[String], models: &[String], knows: F) -> Result<Vec<Target>>
where
    F: Fn(&str, &str) -> bool,
{
    let providers = providers
        .iter()
        .map(|p| ModelResolver::canonical_provider(p))
        .collect::<Result<Vec<_>>>()?;

    let mut targets: Vec<Target> = Vec::new();
    let mut push = |target: Target| {
        if !targets.contains(&target) {
            targets.push(target);
        }
    };

    for model in models {
        let resolved = ModelResolver::resolve(model)?;
        match resolved.provider {
            Some(provider) => {
                if providers.is_empty() || providers.contains(&provider) {
                    push(Target::new(provider, resolved.model_id));
                }
            }
            None => {
                for provider in providers.iter().filter(|p| !is_custom_id(p)) {
                    if knows(provider, &resolved.model_id) {
                        push(Target::new(provider.clone(), resolved.model_id.clone()));
                    }
                }
            }
        }
    }

    for provider in providers.iter().filter(|p| is_custom_id(p)) {
        push(Target::new(provider.clone(), provider.clone()));
    }

    if targets.is_empty() {
        anyhow::bail!(
            "没有可用的目标：providers={:?}, models={:?}",
            providers,
            models
        );
    }

    Ok(targets)
}
