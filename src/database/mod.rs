//! 数据库模块
//!
//! 包含数据模型、持久化接口与 SQLite 实现

pub mod migrations;
pub mod models;
pub mod repository;
pub mod storage;

pub use migrations::{app_dir, get_db_path, initialize_database};
pub use models::{
    ConversationEntry, CustomProviderRecord, CustomProviderType, EncryptedSecret, ResponseRecord,
    ResponseStatus, SecretSchema,
};
pub use repository::SqliteStorage;
pub use storage::Storage;
