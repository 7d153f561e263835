//! AES-256-GCM 加解密
//!
//! 每条密文使用独立的 16 字节 salt 与 12 字节 IV，
//! 密钥由主密钥经 PBKDF2-HMAC-SHA256 派生，用后即清零。

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, ExposeSecretMut, SecretBox, SecretString};
use sha2::Sha256;

use crate::database::models::SecretSchema;
use crate::vault::master::MasterSecret;
use crate::vault::VaultError;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// 默认 PBKDF2 迭代次数
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// 加密结果（均为 base64）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub encrypted_data: String,
    pub iv: String,
    pub salt: String,
    pub key_id: String,
}

/// 解密输入
#[derive(Debug, Clone, Copy)]
pub struct SealedRef<'a> {
    pub encrypted_data: &'a str,
    pub iv: &'a str,
    pub salt: Option<&'a str>,
    pub key_id: &'a str,
    pub schema: SecretSchema,
}

pub struct SecretCipher {
    master: MasterSecret,
    iterations: u32,
}

impl SecretCipher {
    pub fn new(master: MasterSecret, iterations: u32) -> Self {
        Self {
            master,
            iterations: iterations.max(1),
        }
    }

    pub fn key_id(&self) -> &str {
        self.master.key_id()
    }

    fn derive_key(&self, salt: &[u8]) -> SecretBox<[u8; KEY_LEN]> {
        let mut key = SecretBox::new(Box::new([0u8; KEY_LEN]));
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.master.expose().as_bytes(),
            salt,
            self.iterations,
            key.expose_secret_mut(),
        );
        key
    }

    pub fn encrypt(&self, plaintext: &SecretString) -> Result<SealedSecret, VaultError> {
        let plaintext = plaintext.expose_secret();
        if plaintext.is_empty() {
            return Err(VaultError::Encryption("不能加密空字符串".to_string()));
        }

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose_secret()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption("AES-GCM 加密失败".to_string()))?;

        Ok(SealedSecret {
            encrypted_data: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(iv),
            salt: STANDARD.encode(salt),
            key_id: self.key_id().to_string(),
        })
    }

    pub fn decrypt(&self, sealed: SealedRef<'_>) -> Result<SecretString, VaultError> {
        if sealed.schema == SecretSchema::Legacy {
            return Err(VaultError::LegacySecret);
        }
        let salt = sealed.salt.ok_or(VaultError::LegacySecret)?;

        if sealed.key_id != self.key_id() {
            return Err(VaultError::Encryption(format!(
                "密钥标识不匹配：记录为 {}，当前为 {}",
                sealed.key_id,
                self.key_id()
            )));
        }

        let salt = decode(salt, "salt")?;
        let iv = decode(sealed.iv, "iv")?;
        let ciphertext = decode(sealed.encrypted_data, "encrypted_data")?;

        if iv.len() != IV_LEN {
            return Err(VaultError::Encryption(format!("IV 长度无效: {}", iv.len())));
        }
        if salt.len() != SALT_LEN {
            return Err(VaultError::Encryption(format!("salt 长度无效: {}", salt.len())));
        }

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.expose_secret()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| VaultError::Encryption("解密失败：密文被篡改或主密钥已变化".to_string()))?;

        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Encryption("解密结果不是有效的 UTF-8".to_string()))?;
        Ok(SecretString::from(plaintext))
    }
}

fn decode(value: &str, field: &str) -> Result<Vec<u8>, VaultError> {
    STANDARD
        .decode(value)
        .map_err(|e| VaultError::Encryption(format!("{} 不是有效的 base64: {}", field, e)))
}

/// 掩码显示 API Key：长度超过 12 时为 "前4...后4"，否则 "****"
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
