//! SQLite 数据仓库
//!
//! `Storage` 的 SQLite 实现：凭证、对话、响应与自定义提供商的 CRUD

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::database::migrations;
use crate::database::models::{
    ConversationEntry, CustomProviderRecord, CustomProviderType, EncryptedSecret, ResponseRecord,
    ResponseStatus, SecretSchema,
};
use crate::database::storage::Storage;
use crate::llm::errors::ErrorCode;
use crate::llm::model_resolver::Target;

/// 行解析失败
#[derive(Debug)]
struct ColumnParseError(String);

impl std::fmt::Display for ColumnParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "字段解析错误: {}", self.0)
    }
}

impl std::error::Error for ColumnParseError {}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(ColumnParseError(message)))
}

fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("{}: {}", value, e)))
}

fn parse_optional_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(idx, &v)).transpose()
}

/// SQLite 仓库
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// 使用共享连接创建仓库实例（调用方负责迁移）
    pub fn with_conn(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 打开数据库文件并执行迁移
    pub fn open(path: &Path) -> Result<Self> {
        let conn = migrations::initialize_database(path)?;
        Ok(Self::with_conn(Arc::new(Mutex::new(conn))))
    }

    /// 内存数据库，主要用于测试
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self::with_conn(Arc::new(Mutex::new(conn))))
    }

    /// 辅助方法：获取连接锁
    fn with_conn_inner<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("获取数据库连接锁失败（Mutex 已被毒化）: {}", e))?;
        f(&conn)
    }

    fn secret_from_row(row: &Row<'_>) -> rusqlite::Result<EncryptedSecret> {
        let schema: String = row.get(6)?;
        let schema = SecretSchema::parse(&schema)
            .ok_or_else(|| conversion_error(6, format!("未知的记录格式: {}", schema)))?;
        let created_at: String = row.get(7)?;

        Ok(EncryptedSecret {
            provider_name: row.get(0)?,
            name: row.get(1)?,
            encrypted_data: row.get(2)?,
            iv: row.get(3)?,
            salt: row.get(4)?,
            key_id: row.get(5)?,
            schema,
            created_at: parse_time(7, &created_at)?,
            last_used: parse_optional_time(8, row.get(8)?)?,
        })
    }

    fn response_from_row(row: &Row<'_>) -> rusqlite::Result<ResponseRecord> {
        let status: String = row.get(6)?;
        let status = ResponseStatus::parse(&status)
            .ok_or_else(|| conversion_error(6, format!("未知的状态: {}", status)))?;
        let timestamp: String = row.get(7)?;
        let error_code: Option<String> = row.get(10)?;
        let usage_json: Option<String> = row.get(12)?;
        let usage = usage_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| conversion_error(12, e.to_string()))?;

        Ok(ResponseRecord {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            provider_id: row.get(2)?,
            model: row.get(3)?,
            prompt: row.get(4)?,
            response: row.get(5)?,
            status,
            timestamp: parse_time(7, &timestamp)?,
            duration_ms: row.get::<_, Option<i64>>(8)?.map(|d| d.max(0) as u64),
            error: row.get(9)?,
            error_code: error_code.as_deref().and_then(ErrorCode::parse),
            turn: row.get(11)?,
            usage,
            finish_reason: row.get(13)?,
        })
    }

    fn custom_from_row(row: &Row<'_>) -> rusqlite::Result<CustomProviderRecord> {
        let provider_type: String = row.get(3)?;
        let provider_type = CustomProviderType::parse(&provider_type)
            .map_err(|e| conversion_error(3, e.to_string()))?;
        let created_at: String = row.get(5)?;

        Ok(CustomProviderRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            base_url: row.get(2)?,
            provider_type,
            model: row.get(4)?,
            created_at: parse_time(5, &created_at)?,
        })
    }

    fn upsert_response(conn: &Connection, record: &ResponseRecord) -> Result<()> {
        let usage_json = record.usage.map(|u| serde_json::to_string(&u)).transpose()?;

        conn.execute(
            "INSERT INTO responses (
                id, conversation_id, provider_id, model, prompt, response, status,
                timestamp, duration_ms, error, error_code, turn, usage_json, finish_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO UPDATE SET
                response = excluded.response,
                status = excluded.status,
                duration_ms = excluded.duration_ms,
                error = excluded.error,
                error_code = excluded.error_code,
                usage_json = excluded.usage_json,
                finish_reason = excluded.finish_reason",
            params![
                record.id,
                record.conversation_id,
                record.provider_id,
                record.model,
                record.prompt,
                record.response,
                record.status.as_str(),
                record.timestamp.to_rfc3339(),
                record.duration_ms.map(|d| d as i64),
                record.error,
                record.error_code.map(|c| c.as_str()),
                record.turn,
                usage_json,
                record.finish_reason,
            ],
        )
        .with_context(|| format!("保存响应失败: {}", record.id))?;
        Ok(())
    }

    fn load_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationEntry>> {
        let row = conn
            .query_row(
                "SELECT id, prompt, targets_json, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    let created_at: String = row.get(3)?;
                    let updated_at: String = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        parse_time(3, &created_at)?,
                        parse_time(4, &updated_at)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, prompt, targets_json, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let targets: Vec<Target> = serde_json::from_str(&targets_json)
            .with_context(|| format!("对话 {} 的目标列表损坏", id))?;

        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, provider_id, model, prompt, response, status,
                    timestamp, duration_ms, error, error_code, turn, usage_json, finish_reason
             FROM responses
             WHERE conversation_id = ?1
             ORDER BY turn ASC, timestamp ASC",
        )?;
        let responses = stmt
            .query_map(params![id], Self::response_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ConversationEntry {
            id,
            prompt,
            targets,
            responses,
            created_at,
            updated_at,
        }))
    }
}

impl Storage for SqliteStorage {
    fn store_api_key(&self, secret: &EncryptedSecret) -> Result<()> {
        self.with_conn_inner(|conn| {
            conn.execute(
                "INSERT INTO api_keys (
                    provider_name, name, encrypted_data, iv, salt, key_id, schema_version, created_at, last_used
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(provider_name) DO UPDATE SET
                    name = excluded.name,
                    encrypted_data = excluded.encrypted_data,
                    iv = excluded.iv,
                    salt = excluded.salt,
                    key_id = excluded.key_id,
                    schema_version = excluded.schema_version,
                    created_at = excluded.created_at,
                    last_used = excluded.last_used",
                params![
                    secret.provider_name,
                    secret.name,
                    secret.encrypted_data,
                    secret.iv,
                    secret.salt,
                    secret.key_id,
                    secret.schema.as_str(),
                    secret.created_at.to_rfc3339(),
                    secret.last_used.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    fn get_api_key(&self, provider_name: &str) -> Result<Option<EncryptedSecret>> {
        self.with_conn_inner(|conn| {
            let secret = conn
                .query_row(
                    "SELECT provider_name, name, encrypted_data, iv, salt, key_id, schema_version, created_at, last_used
                     FROM api_keys WHERE provider_name = ?1",
                    params![provider_name],
                    Self::secret_from_row,
                )
                .optional()?;
            Ok(secret)
        })
    }

    fn get_all_api_keys(&self) -> Result<Vec<EncryptedSecret>> {
        self.with_conn_inner(|conn| {
            let mut stmt = conn.prepare(
                "SELECT provider_name, name, encrypted_data, iv, salt, key_id, schema_version, created_at, last_used
                 FROM api_keys ORDER BY provider_name ASC",
            )?;
            let secrets = stmt.query_map([], Self::secret_from_row)?;
            secrets.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    fn delete_api_key(&self, provider_name: &str) -> Result<bool> {
        self.with_conn_inner(|conn| {
            let rows = conn.execute("DELETE FROM api_keys WHERE provider_name = ?1", params![provider_name])?;
            Ok(rows > 0)
        })
    }

    fn touch_api_key(&self, provider_name: &str, used_at: DateTime<Utc>) -> Result<()> {
        self.with_conn_inner(|conn| {
            conn.execute(
                "UPDATE api_keys SET last_used = ?1 WHERE provider_name = ?2",
                params![used_at.to_rfc3339(), provider_name],
            )?;
            Ok(())
        })
    }

    fn save_conversation(&self, entry: &ConversationEntry) -> Result<()> {
        let targets_json = serde_json::to_string(&entry.targets)?;

        self.with_conn_inner(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, prompt, targets_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    targets_json = excluded.targets_json,
                    updated_at = excluded.updated_at",
                params![
                    entry.id,
                    entry.prompt,
                    targets_json,
                    entry.created_at.to_rfc3339(),
                    entry.updated_at.to_rfc3339(),
                ],
            )?;

            for record in &entry.responses {
                Self::upsert_response(&tx, record)?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    fn save_response(&self, record: &ResponseRecord) -> Result<()> {
        self.with_conn_inner(|conn| Self::upsert_response(conn, record))
    }

    fn get_conversation(&self, id: &str) -> Result<Option<ConversationEntry>> {
        self.with_conn_inner(|conn| Self::load_conversation(conn, id))
    }

    fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationEntry>> {
        self.with_conn_inner(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM conversations ORDER BY updated_at DESC LIMIT ?1",
            )?;
            let ids = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = Self::load_conversation(conn, &id)? {
                    entries.push(entry);
                }
            }
            Ok(entries)
        })
    }

    fn delete_conversation(&self, id: &str) -> Result<bool> {
        self.with_conn_inner(|conn| {
            let rows = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
    }

    fn clear_history(&self) -> Result<usize> {
        self.with_conn_inner(|conn| {
            conn.execute("DELETE FROM responses", [])?;
            let rows = conn.execute("DELETE FROM conversations", [])?;
            Ok(rows)
        })
    }

    fn save_custom_provider(&self, record: &CustomProviderRecord) -> Result<()> {
        self.with_conn_inner(|conn| {
            conn.execute(
                "INSERT INTO custom_providers (id, name, base_url, provider_type, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    base_url = excluded.base_url,
                    provider_type = excluded.provider_type,
                    model = excluded.model",
                params![
                    record.id,
                    record.name,
                    record.base_url,
                    record.provider_type.as_str(),
                    record.model,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_custom_provider(&self, id: &str) -> Result<Option<CustomProviderRecord>> {
        self.with_conn_inner(|conn| {
            let record = conn
                .query_row(
                    "SELECT id, name, base_url, provider_type, model, created_at
                     FROM custom_providers WHERE id = ?1",
                    params![id],
                    Self::custom_from_row,
                )
                .optional()?;
            Ok(record)
        })
    }

    fn list_custom_providers(&self) -> Result<Vec<CustomProviderRecord>> {
        self.with_conn_inner(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, base_url, provider_type, model, created_at
                 FROM custom_providers ORDER BY created_at ASC",
            )?;
            let records = stmt.query_map([], Self::custom_from_row)?;
            records.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    fn delete_custom_provider(&self, id: &str) -> Result<bool> {
        self.with_conn_inner(|conn| {
            let rows = conn.execute("DELETE FROM custom_providers WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
    }
}
