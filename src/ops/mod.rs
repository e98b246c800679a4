// 远程操作
//
// 任务类型是封闭集合，按 TaskKind 静态分派到对应实现。

mod command;
mod deploy;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::settings::DeploySettings;
use crate::models::{TaskFailure, TaskKind, TaskOutcome, TaskParams};
use crate::ssh::{OutputSink, RemoteSession, SshError};

pub use command::RunCommand;
pub use deploy::{merge_authorized_keys, DeployKeys, KeyMerge};

/// 操作错误
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Transport(#[from] SshError),

    #[error("Invalid parameters for {kind}: {message}")]
    InvalidParams { kind: &'static str, message: String },
}

impl From<&OperationError> for TaskFailure {
    fn from(e: &OperationError) -> Self {
        match e {
            OperationError::Transport(e) => TaskFailure::from(e),
            OperationError::InvalidParams { .. } => {
                TaskFailure::new(crate::models::FailureKind::Internal, e.to_string())
            }
        }
    }
}

/// 操作执行上下文
pub struct OperationContext<'a> {
    /// 本次任务独占的会话
    pub session: &'a dyn RemoteSession,
    /// 输出接收器（持久化并推送给观察者）
    pub sink: &'a dyn OutputSink,
    pub deploy: &'a DeploySettings,
}

/// 一种远程操作
#[async_trait]
pub trait Operation: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn run(
        &self,
        ctx: &OperationContext<'_>,
        params: &TaskParams,
    ) -> Result<TaskOutcome, OperationError>;
}

static DEPLOY_KEYS: DeployKeys = DeployKeys;
static RUN_COMMAND: RunCommand = RunCommand;

/// 按任务类型查找操作
pub fn operation_for(kind: TaskKind) -> &'static dyn Operation {
    match kind {
        TaskKind::DeployKeys => &DEPLOY_KEYS,
        TaskKind::RunCommand => &RUN_COMMAND,
    }
}
