// 任务与主机持久化（SQLite）
//
// 同一个数据库文件由 API 进程、观察者与执行器进程共享，
// 也是实时输出跨进程传递的媒介（task_output 表）。

mod hosts;
mod keys;
mod tasks;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;
use tracing::{debug, warn};

pub use tasks::{Finalization, OutputChunk};

/// 多进程写入时等待锁的时间
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Background query failed: {0}")]
    Background(String),
}

impl StoreError {
    /// 唯一约束冲突转换为输入错误
    fn from_insert(e: rusqlite::Error, what: &str) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::InvalidInput(format!("{} violates a constraint: {}", what, e))
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

/// 数据库
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 打开（或创建）数据库文件
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidInput(format!(
                        "Cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        debug!("[Store] Opening database {}", path.display());
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 获取连接（锁中毒时恢复）
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| {
            warn!("[Store] Database mutex was poisoned, recovering");
            e.into_inner()
        })
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hosts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    hostname TEXT NOT NULL,
    port INTEGER NOT NULL,
    username TEXT NOT NULL,
    auth_type TEXT NOT NULL CHECK (auth_type IN ('password', 'private_key')),
    password_encrypted BLOB,
    private_key_encrypted BLOB,
    passphrase_encrypted BLOB,
    fingerprint TEXT,
    created_at INTEGER NOT NULL,
    CHECK (
        (auth_type = 'password' AND password_encrypted IS NOT NULL
            AND private_key_encrypted IS NULL AND passphrase_encrypted IS NULL)
        OR
        (auth_type = 'private_key' AND private_key_encrypted IS NOT NULL
            AND password_encrypted IS NULL)
    )
);

CREATE TABLE IF NOT EXISTS public_keys (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    public_key TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    host_id TEXT REFERENCES hosts(id) ON DELETE SET NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    params TEXT NOT NULL,
    stdout TEXT NOT NULL DEFAULT '',
    stderr TEXT NOT NULL DEFAULT '',
    output_location TEXT,
    result TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    heartbeat_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);

CREATE TABLE IF NOT EXISTS task_output (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    stream TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_output_task ON task_output(task_id, seq);
";

/// 当前时间（毫秒时间戳）
fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ocultum.db");
        let first = Database::open(&path).unwrap();
        let second = Database::open(&path).unwrap();

        let mode: String = first
            .conn()
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        drop(second);
    }

    #[test]
    fn test_millis_round_trip() {
        let ms = 1_700_000_000_123;
        assert_eq!(from_millis(ms).timestamp_millis(), ms);
    }
}
