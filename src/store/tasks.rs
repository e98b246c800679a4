// 任务记录状态机的原子操作

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{from_millis, now_millis, Database, StoreError};
use crate::models::{TaskFailure, TaskKind, TaskOutcome, TaskParams, TaskRecord, TaskStatus};
use crate::ssh::OutputStream;

const TASK_COLUMNS: &str = "id, kind, host_id, status, params, stdout, stderr, output_location, \
     result, error, created_at, started_at, finished_at, heartbeat_at";

/// 输出块（按 seq 递增）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputChunk {
    pub seq: i64,
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// 终态写入内容
#[derive(Clone, Debug)]
pub struct Finalization {
    pub status: TaskStatus,
    pub stdout: String,
    pub stderr: String,
    pub output_location: Option<String>,
    pub result: Option<TaskOutcome>,
    pub error: Option<TaskFailure>,
}

/// 数据库原始行
struct TaskRow {
    id: String,
    kind: String,
    host_id: Option<String>,
    status: String,
    params: String,
    stdout: String,
    stderr: String,
    output_location: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    heartbeat_at: Option<i64>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            host_id: row.get(2)?,
            status: row.get(3)?,
            params: row.get(4)?,
            stdout: row.get(5)?,
            stderr: row.get(6)?,
            output_location: row.get(7)?,
            result: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
            heartbeat_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        let kind = TaskKind::parse(&self.kind)
            .ok_or_else(|| StoreError::InvalidInput(format!("unknown task kind '{}'", self.kind)))?;
        let status = TaskStatus::parse(&self.status).ok_or_else(|| {
            StoreError::InvalidInput(format!("unknown task status '{}'", self.status))
        })?;
        Ok(TaskRecord {
            id: self.id,
            kind,
            host_id: self.host_id,
            status,
            params: serde_json::from_str(&self.params)?,
            stdout: self.stdout,
            stderr: self.stderr,
            output_location: self.output_location,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            created_at: from_millis(self.created_at),
            started_at: self.started_at.map(from_millis),
            finished_at: self.finished_at.map(from_millis),
            heartbeat_at: self.heartbeat_at.map(from_millis),
        })
    }
}

impl Database {
    /// 创建 pending 任务
    pub fn create_task(&self, host_id: &str, params: &TaskParams) -> Result<TaskRecord, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        self.conn()
            .execute(
                "INSERT INTO tasks (id, kind, host_id, status, params, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                params![
                    id,
                    params.kind().as_str(),
                    host_id,
                    serde_json::to_string(params)?,
                    now
                ],
            )
            .map_err(|e| StoreError::from_insert(e, "task"))?;
        debug!("[Store] Created {} task {}", params.kind().as_str(), id);

        self.get_task(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                TaskRow::from_row,
            )
            .optional()?;
        row.map(TaskRow::into_record).transpose()
    }

    pub fn task_status(&self, id: &str) -> Result<Option<TaskStatus>, StoreError> {
        let status = self
            .conn()
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(TaskStatus::parse))
    }

    /// 认领指定任务：仅当仍为 pending 时成功
    pub fn claim_task(&self, id: &str) -> Result<bool, StoreError> {
        let now = now_millis();
        let changed = self.conn().execute(
            "UPDATE tasks SET status = 'running', started_at = ?2, heartbeat_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        Ok(changed == 1)
    }

    /// 认领最早的 pending 任务
    pub fn claim_next(&self) -> Result<Option<TaskRecord>, StoreError> {
        loop {
            let candidate = self
                .conn()
                .query_row(
                    "SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at, rowid LIMIT 1",
                    [],
                    |r| r.get::<_, String>(0),
                )
                .optional()?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            // 被其他执行器抢先认领时重新选择
            if self.claim_task(&id)? {
                return self.get_task(&id);
            }
        }
    }

    /// 追加输出块，返回其序号
    pub fn append_output(
        &self,
        task_id: &str,
        stream: OutputStream,
        data: &[u8],
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_output (task_id, stream, data) VALUES (?1, ?2, ?3)",
            params![task_id, stream.as_str(), data],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 读取 seq 之后的输出块
    pub fn output_after(
        &self,
        task_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<OutputChunk>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, stream, data FROM task_output
             WHERE task_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![task_id, after_seq, limit as i64], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, stream, data)| {
                let stream = OutputStream::parse(&stream).ok_or_else(|| {
                    StoreError::InvalidInput(format!("unknown output stream '{}'", stream))
                })?;
                Ok(OutputChunk { seq, stream, data })
            })
            .collect()
    }

    /// 全部输出块
    pub fn collect_output(&self, task_id: &str) -> Result<Vec<OutputChunk>, StoreError> {
        self.output_after(task_id, 0, i64::MAX as usize)
    }

    /// 更新心跳（仅 running 状态）
    pub fn heartbeat(&self, task_id: &str) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE tasks SET heartbeat_at = ?2 WHERE id = ?1 AND status = 'running'",
            params![task_id, now_millis()],
        )?;
        Ok(changed == 1)
    }

    /// 写入终态：仅当仍为 running 时成功，重复写入为空操作
    pub fn finalize_task(&self, task_id: &str, fin: &Finalization) -> Result<bool, StoreError> {
        if !fin.status.is_terminal() {
            return Err(StoreError::InvalidInput(format!(
                "cannot finalize task with non-terminal status '{}'",
                fin.status.as_str()
            )));
        }

        let result = fin.result.as_ref().map(serde_json::to_string).transpose()?;
        let error = fin.error.as_ref().map(serde_json::to_string).transpose()?;

        let changed = self.conn().execute(
            "UPDATE tasks SET status = ?2, stdout = ?3, stderr = ?4, output_location = ?5,
                 result = ?6, error = ?7, finished_at = ?8
             WHERE id = ?1 AND status = 'running'",
            params![
                task_id,
                fin.status.as_str(),
                fin.stdout,
                fin.stderr,
                fin.output_location,
                result,
                error,
                now_millis()
            ],
        )?;
        Ok(changed == 1)
    }

    /// 最近一次心跳早于 cutoff 的 running 任务
    pub fn stale_running_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM tasks
             WHERE status = 'running' AND COALESCE(heartbeat_at, started_at, created_at) < ?1
             ORDER BY created_at",
        )?;
        let ids = stmt
            .query_map(params![cutoff.timestamp_millis()], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// 最近的任务（按创建时间倒序）
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                TASK_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], TaskRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(TaskRow::into_record).collect()
    }
}
