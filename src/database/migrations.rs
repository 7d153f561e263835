//! 数据库迁移和表初始化
//!
//! 管理 SQLite 数据库的版本和表结构

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

/// 数据库文件名
const DB_NAME: &str = "prism_arena.db";

/// 应用目录名
pub const APP_DIR: &str = ".prism-arena";

/// 获取应用目录（不存在时创建）
///
/// 存储位置：
/// - Windows: %USERPROFILE%/.prism-arena
/// - macOS / Linux: ~/.prism-arena
pub fn app_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("无法获取用户目录"))?;
    let app_dir = home_dir.join(APP_DIR);

    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("创建应用目录失败: {}", app_dir.display()))?;

    Ok(app_dir)
}

/// 默认数据库路径
pub fn get_db_path() -> Result<PathBuf> {
    Ok(app_dir()?.join(DB_NAME))
}

/// 数据库版本号
///
/// 每次修改表结构时递增此版本号
pub const CURRENT_DB_VERSION: i32 = 3;

/// 打开数据库文件并执行迁移
pub fn initialize_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {}", parent.display()))?;
        }
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("打开数据库失败: {}", path.display()))?;

    conn.execute("PRAGMA foreign_keys = ON;", [])?;
    run_migrations(&mut conn)?;

    Ok(conn)
}

/// 运行数据库迁移
///
/// 根据版本号执行相应的迁移脚本
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
        [],
    )?;

    let current_version = current_version(conn)?;

    for version in (current_version + 1)..=CURRENT_DB_VERSION {
        match version {
            1 => migrate_v1(conn)?,
            2 => migrate_v2(conn)?,
            3 => migrate_v3(conn)?,
            _ => anyhow::bail!("未知的数据库版本: {}", version),
        }

        let applied_at = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, applied_at],
        )?;
        log::debug!("数据库迁移到版本 {}", version);
    }

    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// 迁移到版本 1: 创建 api_keys 表（无 salt，旧格式）
pub fn migrate_v1(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS api_keys (
            provider_name TEXT PRIMARY KEY,
            name TEXT,
            encrypted_data TEXT NOT NULL,
            iv TEXT NOT NULL,
            key_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_used TEXT
        );",
        [],
    )?;
    Ok(())
}

/// 迁移到版本 2: 加入 salt 与记录格式版本
///
/// 已有记录保持 `legacy`，解密时会被拒绝并提示重新录入
pub fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("ALTER TABLE api_keys ADD COLUMN salt TEXT;", [])?;
    tx.execute(
        "ALTER TABLE api_keys ADD COLUMN schema_version TEXT NOT NULL DEFAULT 'legacy';",
        [],
    )?;
    tx.commit()?;
    Ok(())
}

/// 迁移到版本 3: 对话、响应与自定义提供商
pub fn migrate_v3(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            prompt TEXT NOT NULL,
            targets_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
        [],
    )?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS responses (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            provider_id TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            status TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            duration_ms INTEGER,
            error TEXT,
            error_code TEXT,
            turn INTEGER NOT NULL DEFAULT 0,
            usage_json TEXT,
            finish_reason TEXT
        );",
        [],
    )?;

    // 创建索引: 按对话加载响应
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_conversation
         ON responses(conversation_id, turn);",
        [],
    )?;

    // 创建索引: 历史列表
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
         ON conversations(updated_at DESC);",
        [],
    )?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS custom_providers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            model TEXT NOT NULL,
            created_at TEXT NOT NULL
        );",
        [],
    )?;

    tx.commit()?;
    Ok(())
}
