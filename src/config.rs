//! 应用配置
//!
//! 从 `~/.prism-arena/config.toml` 加载，文件不存在时使用默认值。
//!
//! ```toml
//! [vault]
//! master_secret = "keyring"
//!
//! [request]
//! timeout_secs = 60
//!
//! [providers.ollama]
//! base_url = "http://192.168.1.10:11434"
//! extra_models = ["qwen2.5:7b"]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::database::app_dir;
use crate::llm::interface::{ProviderConfig, ProviderConfigSchema};
use crate::vault::{MasterSecretSource, DEFAULT_ITERATIONS};

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub storage: StorageConfig,
    pub request: RequestConfig,
    /// 所有请求的默认生成参数
    pub defaults: ProviderConfig,
    /// 按提供商 ID 覆盖的设置
    pub providers: HashMap<String, ProviderSettings>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// 主密钥来源：fingerprint（默认）或 keyring
    pub master_secret: MasterSecretSource,
    /// PBKDF2 迭代次数
    pub iterations: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_secret: MasterSecretSource::default(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 数据库路径，未设置时为 `~/.prism-arena/prism_arena.db`
    pub database_path: Option<PathBuf>,
    /// 启动时加载的历史对话数量
    pub history_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// 单个目标的空闲超时（秒）：等待首个结果或两个流式块之间的最长时间
    pub timeout_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 默认是否流式
    pub stream: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            connect_timeout_secs: 10,
            stream: true,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// 覆盖默认 API 地址
    pub base_url: Option<String>,
    /// 追加到内置目录的模型
    pub extra_models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error / warn / info / debug / trace
    pub level: String,
    /// 超过该耗时（毫秒）的调度记录警告
    pub slow_dispatch_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            slow_dispatch_ms: 30_000,
        }
    }
}

impl AppConfig {
    /// 默认配置文件路径
    pub fn default_path() -> Result<PathBuf> {
        Ok(app_dir()?.join(CONFIG_FILE_NAME))
    }

    /// 加载配置；文件不存在时返回默认值
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {:?}", path))?;

        config.validate()?;
        log::info!("已加载配置: {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("创建配置目录失败")?;
        }
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content).with_context(|| format!("写入配置文件失败: {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.vault.iterations == 0 {
            anyhow::bail!("vault.iterations 必须大于 0");
        }
        if self.request.timeout_secs == 0 {
            anyhow::bail!("request.timeout_secs 必须大于 0");
        }
        if self.request.connect_timeout_secs == 0 {
            anyhow::bail!("request.connect_timeout_secs 必须大于 0");
        }
        if log_level(&self.logging.level).is_none() {
            anyhow::bail!("无效的日志级别: {}", self.logging.level);
        }

        ProviderConfigSchema::default()
            .validate(&self.defaults)
            .map_err(|e| anyhow::anyhow!("[defaults] {}", e.message))?;

        for (id, settings) in &self.providers {
            if let Some(url) = &settings.base_url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    anyhow::bail!("providers.{}.base_url 必须以 http:// 或 https:// 开头", id);
                }
            }
        }
        Ok(())
    }

    /// 数据库路径（配置优先）
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => crate::database::get_db_path(),
        }
    }

    pub fn provider(&self, id: &str) -> ProviderSettings {
        self.providers.get(id).cloned().unwrap_or_default()
    }

    pub fn log_level(&self) -> log::LevelFilter {
        log_level(&self.logging.level).unwrap_or(log::LevelFilter::Info)
    }
}

fn log_level(level: &str) -> Option<log::LevelFilter> {
    level.parse::<log::LevelFilter>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(&dir.path().join("none.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.vault.iterations, DEFAULT_ITERATIONS);
        assert!(config.request.stream);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
[vault]
master_secret = "keyring"

[defaults]
temperature = 0.2

[providers.ollama]
base_url = "http://10.0.0.2:11434"
extra_models = ["qwen2.5:7b"]
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.vault.master_secret, MasterSecretSource::Keyring);
        assert_eq!(config.vault.iterations, DEFAULT_ITERATIONS);
        assert_eq!(config.defaults.temperature, Some(0.2));
        assert_eq!(config.request.timeout_secs, 120);
        let ollama = config.provider("ollama");
        assert_eq!(ollama.base_url.as_deref(), Some("http://10.0.0.2:11434"));
        assert_eq!(ollama.extra_models, vec!["qwen2.5:7b".to_string()]);
        assert_eq!(config.provider("openai"), ProviderSettings::default());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::default();
        config.request.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.defaults.temperature = Some(5.0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.providers.insert(
            "openai".to_string(),
            ProviderSettings {
                base_url: Some("api.openai.com".to_string()),
                extra_models: Vec::new(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = AppConfig::default();
        config.logging.level = "debug".to_string();
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.log_level(), log::LevelFilter::Debug);
    }
}
