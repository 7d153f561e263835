//! 主密钥来源
//!
//! - `fingerprint`（默认）：设备指纹派生，兼容旧数据
//! - `keyring`：随机 32 字节密钥保存在系统密钥库
//!   (Windows Credential Manager, macOS Keychain, Linux Secret Service)

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::{Entry, Error as KeyringError};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::vault::fingerprint::Fingerprint;

/// 密钥库服务名称
const KEYRING_SERVICE: &str = "prism-arena-vault";

/// 密钥库用户名
const KEYRING_USER: &str = "master-secret";

pub const FINGERPRINT_KEY_ID: &str = "fingerprint-v1";
pub const KEYRING_KEY_ID: &str = "keyring-v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterSecretSource {
    #[default]
    Fingerprint,
    Keyring,
}

impl MasterSecretSource {
    pub fn key_id(&self) -> &'static str {
        match self {
            MasterSecretSource::Fingerprint => FINGERPRINT_KEY_ID,
            MasterSecretSource::Keyring => KEYRING_KEY_ID,
        }
    }
}

/// 加解密使用的主密钥及其标识
#[derive(Clone)]
pub struct MasterSecret {
    secret: SecretString,
    key_id: String,
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterSecret")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl MasterSecret {
    pub fn new(secret: SecretString, key_id: impl Into<String>) -> Self {
        Self {
            secret,
            key_id: key_id.into(),
        }
    }

    pub fn from_fingerprint(fingerprint: &Fingerprint) -> Self {
        Self::new(
            SecretString::from(fingerprint.master_password()),
            FINGERPRINT_KEY_ID,
        )
    }

    /// 按来源加载主密钥；keyring 中没有时生成并保存
    pub fn load(source: MasterSecretSource) -> Result<Self> {
        match source {
            MasterSecretSource::Fingerprint => Ok(Self::from_fingerprint(&Fingerprint::collect())),
            MasterSecretSource::Keyring => Self::from_keyring(),
        }
    }

    fn from_keyring() -> Result<Self> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER).context("创建 keyring Entry 失败")?;

        let secret = match entry.get_password() {
            Ok(existing) => existing,
            Err(KeyringError::NoEntry) => {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                let generated = STANDARD.encode(bytes);
                entry
                    .set_password(&generated)
                    .context("保存主密钥到系统密钥库失败")?;
                log::info!("已在系统密钥库中生成新的主密钥");
                generated
            }
            Err(e) => return Err(e).context("读取系统密钥库失败"),
        };

        Ok(Self::new(SecretString::from(secret), KEYRING_KEY_ID))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub(crate) fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}
