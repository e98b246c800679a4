// TaskRecord 数据结构与状态定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::SshError;

/// 任务类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    DeployKeys,
    RunCommand,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeployKeys => "deploy-keys",
            Self::RunCommand => "run-command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploy-keys" => Some(Self::DeployKeys),
            "run-command" => Some(Self::RunCommand),
            _ => None,
        }
    }
}

/// 任务状态
/// pending → running → {succeeded, failed}，终态不可再迁移
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// 任务参数
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskParams {
    DeployKeys { keys: Vec<String> },
    RunCommand { command: String, timeout_secs: u64 },
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::DeployKeys { .. } => TaskKind::DeployKeys,
            Self::RunCommand { .. } => TaskKind::RunCommand,
        }
    }
}

/// 操作成功（或以非零退出码结束）时的结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// 部署结果：新增数量与部署后的总条目数
    Deploy { added: usize, total: usize },
    /// 命令结果
    Command {
        exit_code: Option<u32>,
        signal: Option<String>,
        output_bytes: u64,
    },
}

impl TaskOutcome {
    pub fn exit_code(&self) -> Option<u32> {
        match self {
            Self::Deploy { .. } => None,
            Self::Command { exit_code, .. } => *exit_code,
        }
    }
}

/// 失败分类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    HostKeyMismatch,
    NetworkTimeout,
    Connect,
    Timeout,
    Permission,
    Io,
    NotFound,
    ConnectionLost,
    HostNotFound,
    NonZeroExit,
    Stale,
    Internal,
}

/// 失败任务的结构化原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SshError> for TaskFailure {
    fn from(e: &SshError) -> Self {
        let kind = match e {
            SshError::Auth(_) | SshError::Key(_) => FailureKind::Authentication,
            SshError::HostKeyMismatch { .. } => FailureKind::HostKeyMismatch,
            SshError::ConnectTimeout(_) => FailureKind::NetworkTimeout,
            SshError::Connect(_) | SshError::Protocol(_) => FailureKind::Connect,
            SshError::Timeout(_) => FailureKind::Timeout,
            SshError::Permission(_) => FailureKind::Permission,
            SshError::Io(_) => FailureKind::Io,
            SshError::NotFound(_) => FailureKind::NotFound,
            SshError::Channel(_) | SshError::ConnectionLost(_) => FailureKind::ConnectionLost,
            SshError::Config(_) => FailureKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}

/// 任务记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    /// 主机删除后为 None
    pub host_id: Option<String>,
    pub status: TaskStatus,
    pub params: TaskParams,
    /// 内联保存的 stdout（超出上限时截断）
    pub stdout: String,
    pub stderr: String,
    /// 完整输出的外部存储位置（仅输出超出上限时）
    pub output_location: Option<String>,
    pub result: Option<TaskOutcome>,
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 执行器最近一次心跳
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn exit_code(&self) -> Option<u32> {
        self.result.as_ref().and_then(TaskOutcome::exit_code)
    }
}
