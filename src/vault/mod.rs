//! 本地凭证保险库
//!
//! API Key 以 AES-256-GCM 加密后交给持久化层保存；明文只在调用提供商时短暂存在。
//!
//! 主密钥默认由设备指纹派生（本地混淆，兼容旧数据），也可改为保存在系统密钥库中的随机密钥。

pub mod cipher;
pub mod fingerprint;
pub mod master;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::database::models::{EncryptedSecret, SecretSchema};
use crate::database::storage::Storage;
use crate::llm::errors::{ErrorCode, LlmError};

pub use cipher::{mask_api_key, SealedRef, SealedSecret, SecretCipher, DEFAULT_ITERATIONS};
pub use fingerprint::Fingerprint;
pub use master::{MasterSecret, MasterSecretSource};

/// 列表中无法解密的记录显示的占位符
pub const DECRYPTION_ERROR_PLACEHOLDER: &str = "[decryption error]";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("未找到 {0} 的 API Key")]
    NotFound(String),

    #[error("该 API Key 以旧格式保存（无 salt），请重新录入")]
    LegacySecret,

    #[error("加解密失败: {0}")]
    Encryption(String),

    #[error("凭证存储访问失败: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<VaultError> for LlmError {
    fn from(err: VaultError) -> Self {
        match &err {
            VaultError::NotFound(provider) => LlmError::missing_api_key(provider),
            VaultError::LegacySecret | VaultError::Encryption(_) => {
                LlmError::new(ErrorCode::EncryptionError, err.to_string())
            }
            VaultError::Storage(_) => LlmError::new(ErrorCode::UnknownError, err.to_string()),
        }
    }
}

/// `list_api_keys` 的条目：只含掩码
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKeySummary {
    pub provider_name: String,
    pub name: Option<String>,
    pub masked_key: String,
    pub key_id: String,
    pub schema: SecretSchema,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

pub struct CredentialVault {
    storage: Arc<dyn Storage>,
    cipher: SecretCipher,
}

impl CredentialVault {
    pub fn new(storage: Arc<dyn Storage>, cipher: SecretCipher) -> Self {
        Self { storage, cipher }
    }

    /// 按来源加载主密钥并创建保险库
    pub fn open(storage: Arc<dyn Storage>, source: MasterSecretSource, iterations: u32) -> anyhow::Result<Self> {
        let master = MasterSecret::load(source)?;
        log::debug!("保险库主密钥来源: {}", master.key_id());
        Ok(Self::new(storage, SecretCipher::new(master, iterations)))
    }

    pub fn key_id(&self) -> &str {
        self.cipher.key_id()
    }

    /// 加密并保存，已存在时覆盖
    pub fn store_api_key(
        &self,
        provider_name: &str,
        api_key: &SecretString,
        name: Option<String>,
    ) -> Result<(), VaultError> {
        let trimmed = api_key.expose_secret().trim();
        if trimmed.is_empty() {
            return Err(VaultError::Encryption("API Key 不能为空".to_string()));
        }

        let sealed = self.cipher.encrypt(&SecretString::from(trimmed.to_string()))?;
        let secret = EncryptedSecret {
            provider_name: provider_name.to_string(),
            name,
            encrypted_data: sealed.encrypted_data,
            iv: sealed.iv,
            salt: Some(sealed.salt),
            key_id: sealed.key_id,
            schema: SecretSchema::Salted,
            created_at: Utc::now(),
            last_used: None,
        };

        self.storage.store_api_key(&secret)?;
        log::info!("已保存 {} 的 API Key ({})", provider_name, mask_api_key(trimmed));
        Ok(())
    }

    /// 解密并更新最近使用时间
    pub fn decrypt_api_key(&self, provider_name: &str) -> Result<SecretString, VaultError> {
        let secret = self
            .storage
            .get_api_key(provider_name)?
            .ok_or_else(|| VaultError::NotFound(provider_name.to_string()))?;

        let plain = self.decrypt_record(&secret)?;

        if let Err(e) = self.storage.touch_api_key(provider_name, Utc::now()) {
            log::warn!("更新 {} 的最近使用时间失败: {:#}", provider_name, e);
        }
        Ok(plain)
    }

    /// 所有凭证的掩码列表；单条解密失败不影响整体
    pub fn list_api_keys(&self) -> Result<Vec<ApiKeySummary>, VaultError> {
        let secrets = self.storage.get_all_api_keys()?;

        Ok(secrets
            .into_iter()
            .map(|secret| {
                let masked_key = match self.decrypt_record(&secret) {
                    Ok(plain) => mask_api_key(plain.expose_secret()),
                    Err(e) => {
                        log::warn!("{} 的 API Key 无法解密: {}", secret.provider_name, e);
                        DECRYPTION_ERROR_PLACEHOLDER.to_string()
                    }
                };
                ApiKeySummary {
                    provider_name: secret.provider_name,
                    name: secret.name,
                    masked_key,
                    key_id: secret.key_id,
                    schema: secret.schema,
                    created_at: secret.created_at,
                    last_used: secret.last_used,
                }
            })
            .collect())
    }

    pub fn delete_api_key(&self, provider_name: &str) -> Result<bool, VaultError> {
        let deleted = self.storage.delete_api_key(provider_name)?;
        if deleted {
            log::info!("已删除 {} 的 API Key", provider_name);
        }
        Ok(deleted)
    }

    /// 存储访问失败视为不存在
    pub fn has_api_key(&self, provider_name: &str) -> bool {
        matches!(self.storage.get_api_key(provider_name), Ok(Some(_)))
    }

    fn decrypt_record(&self, secret: &EncryptedSecret) -> Result<SecretString, VaultError> {
        self.cipher.decrypt(SealedRef {
            encrypted_data: &secret.encrypted_data,
            iv: &secret.iv,
            salt: secret.salt.as_deref(),
            key_id: &secret.key_id,
            schema: secret.schema,
        })
    }
}
