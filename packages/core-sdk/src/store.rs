use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{thread, time::Duration};

use crate::models::ChatMessage;

pub const HISTORY_KEY: &str = "console-chat-history";
pub const PROVIDER_KEY: &str = "console-chat-provider";
pub const OPENAI_KEY_KEY: &str = "console-chat-openai-key";
pub const GEMINI_KEY_KEY: &str = "console-chat-gemini-key";
pub const SYSTEM_PROMPT_KEY: &str = "console-chat-system-prompt";
pub const OPENAI_MODEL_KEY: &str = "console-chat-openai-model";
pub const GEMINI_MODEL_KEY: &str = "console-chat-gemini-model";

/**
 * \brief 打开默认数据库文件（本地目录下的 consolechat.db）并完成迁移。
 */
pub fn open_default_store() -> Result<Connection> {
    let conn = Connection::open("consolechat.db")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrate(&conn)?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建键值表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        "#,
        )
    })
}

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row("SELECT value FROM kv WHERE key=?1", params![key], |row| {
            row.get::<_, Option<String>>(0)
        })
        .optional()?;
    Ok(val.flatten())
}

pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

pub fn remove(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM kv WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 读取缓存的对话历史；内容损坏时记录警告并视为空历史。
 */
pub fn load_history(conn: &Connection) -> Result<Vec<ChatMessage>> {
    let Some(raw) = get(conn, HISTORY_KEY)? else {
        return Ok(Vec::new());
    };
    match serde_json::from_str(&raw) {
        Ok(history) => Ok(history),
        Err(e) => {
            tracing::warn!(error = %e, "cached history is corrupt, starting fresh");
            Ok(Vec::new())
        }
    }
}

pub fn save_history(conn: &Connection, history: &[ChatMessage]) -> Result<()> {
    set(conn, HISTORY_KEY, &serde_json::to_string(history)?)
}

pub fn clear_history(conn: &Connection) -> Result<()> {
    remove(conn, HISTORY_KEY)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                tracing::debug!(attempt, "sqlite locked, retrying");
                thread::sleep(backoff);
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!("database stayed locked after {} retries", MAX_RETRIES)
}
