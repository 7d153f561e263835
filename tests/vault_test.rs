//! 保险库集成测试：文件数据库 + 不同主密钥

use std::sync::Arc;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;

use prism_arena::database::models::{EncryptedSecret, SecretSchema};
use prism_arena::database::{SqliteStorage, Storage};
use prism_arena::llm::{ErrorCode, LlmError};
use prism_arena::vault::{CredentialVault, MasterSecret, SecretCipher, VaultError, DECRYPTION_ERROR_PLACEHOLDER};

fn open_vault(dir: &TempDir, password: &str) -> (CredentialVault, Arc<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::open(&dir.path().join("arena.db")).unwrap());
    let master = MasterSecret::new(SecretString::from(password.to_string()), "fingerprint-v1");
    (CredentialVault::new(storage.clone(), SecretCipher::new(master, 1_000)), storage)
}

fn key(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

#[test]
fn test_listing_never_exposes_plaintext() {
    let dir = TempDir::new().unwrap();
    let (vault, storage) = open_vault(&dir, "device-a");
    vault.store_api_key("openai", &key("sk-test-1234567890"), None).unwrap();

    let list = vault.list_api_keys().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].masked_key, "sk-t...7890");
    assert_ne!(list[0].masked_key, "sk-test-1234567890");
    assert!(!list[0].masked_key.contains("123456"));

    let stored = storage.get_api_key("openai").unwrap().unwrap();
    assert_eq!(stored.schema, SecretSchema::Salted);
    assert!(!stored.encrypted_data.contains("sk-test"));
    assert!(stored.salt.is_some());
}

#[test]
fn test_secret_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (vault, _) = open_vault(&dir, "device-a");
        vault.store_api_key("anthropic", &key("sk-ant-abcdefghijklmnop"), Some("work".into())).unwrap();
    }

    let (vault, _) = open_vault(&dir, "device-a");
    assert!(vault.has_api_key("anthropic"));
    assert_eq!(vault.decrypt_api_key("anthropic").unwrap().expose_secret(), "sk-ant-abcdefghijklmnop");
    assert!(vault.list_api_keys().unwrap()[0].last_used.is_some());
}

#[test]
fn test_other_device_cannot_decrypt() {
    let dir = TempDir::new().unwrap();
    {
        let (vault, _) = open_vault(&dir, "device-a");
        vault.store_api_key("openai", &key("sk-test-1234567890"), None).unwrap();
    }

    let (vault, _) = open_vault(&dir, "device-b");
    let err = vault.decrypt_api_key("openai").unwrap_err();
    assert!(matches!(err, VaultError::Encryption(_)));
    assert_eq!(LlmError::from(err).code, ErrorCode::EncryptionError);

    let list = vault.list_api_keys().unwrap();
    assert_eq!(list[0].masked_key, DECRYPTION_ERROR_PLACEHOLDER);
}

#[test]
fn test_legacy_record_requires_reentry() {
    let dir = TempDir::new().unwrap();
    let (vault, storage) = open_vault(&dir, "device-a");
    storage
        .store_api_key(&EncryptedSecret {
            provider_name: "google".to_string(),
            name: None,
            encrypted_data: "c29tZS1vbGQtY2lwaGVydGV4dA==".to_string(),
            iv: "AAAAAAAAAAAAAAAA".to_string(),
            salt: None,
            key_id: "fingerprint-v1".to_string(),
            schema: SecretSchema::Legacy,
            created_at: Utc::now(),
            last_used: None,
        })
        .unwrap();

    let err = vault.decrypt_api_key("google").unwrap_err();
    assert!(matches!(err, VaultError::LegacySecret));

    vault.store_api_key("google", &key("AIza-new-key-0000"), None).unwrap();
    assert_eq!(vault.decrypt_api_key("google").unwrap().expose_secret(), "AIza-new-key-0000");
}

#[test]
fn test_overwrite_and_delete() {
    let dir = TempDir::new().unwrap();
    let (vault, _) = open_vault(&dir, "device-a");
    vault.store_api_key("openai", &key("sk-first-000000000"), None).unwrap();
    vault.store_api_key("openai", &key("sk-second-11111111"), None).unwrap();

    assert_eq!(vault.list_api_keys().unwrap().len(), 1);
    assert_eq!(vault.decrypt_api_key("openai").unwrap().expose_secret(), "sk-second-11111111");

    assert!(vault.delete_api_key("openai").unwrap());
    let err = vault.decrypt_api_key("openai").unwrap_err();
    assert_eq!(LlmError::from(err).code, ErrorCode::MissingApiKey);
}
