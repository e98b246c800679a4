// 任务执行器
//
// 单个任务的流程：认领 → 解析主机并解密凭据 → 连接 → 执行操作 → 关闭会话 → 写入终态。
// 单个任务的任何失败都转换为 failed 终态，不会中断执行循环。
// 执行器内部不做重试。

mod output;
mod worker;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::live::LiveOutputChannel;
use crate::models::settings::{DeploySettings, OutputSettings, RunnerSettings};
use crate::models::{FailureKind, TaskFailure, TaskOutcome, TaskRecord, TaskStatus};
use crate::ops::{operation_for, OperationContext};
use crate::ssh::{OutputSink, OutputStream, SessionConnector};
use crate::store::{Database, Finalization, StoreError};
use crate::vault::CredentialVault;

pub use output::{artifact_key, bound_output, ArtifactStore, BoundedOutput, FsArtifactStore};
pub use worker::WorkerPool;

/// 执行结论
#[derive(Debug)]
struct Verdict {
    result: Option<TaskOutcome>,
    error: Option<TaskFailure>,
}

impl Verdict {
    fn failed(failure: TaskFailure) -> Self {
        Self {
            result: None,
            error: Some(failure),
        }
    }

    fn status(&self) -> TaskStatus {
        if self.error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Succeeded
        }
    }
}

/// 执行器依赖
pub struct TaskRunner {
    db: Arc<Database>,
    vault: Arc<CredentialVault>,
    connector: Arc<dyn SessionConnector>,
    live: Arc<LiveOutputChannel>,
    artifacts: Arc<dyn ArtifactStore>,
    runner: RunnerSettings,
    output: OutputSettings,
    deploy: DeploySettings,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        vault: Arc<CredentialVault>,
        connector: Arc<dyn SessionConnector>,
        live: Arc<LiveOutputChannel>,
        artifacts: Arc<dyn ArtifactStore>,
        runner: RunnerSettings,
        output: OutputSettings,
        deploy: DeploySettings,
    ) -> Self {
        Self {
            db,
            vault,
            connector,
            live,
            artifacts,
            runner,
            output,
            deploy,
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.runner
    }

    /// 认领并执行最早的 pending 任务；没有任务时返回 None
    pub async fn run_next(&self) -> Result<Option<TaskRecord>, StoreError> {
        match self.db.claim_next()? {
            Some(task) => self.execute(task).await.map(Some),
            None => Ok(None),
        }
    }

    /// 认领并执行指定任务；已被认领时返回 None
    pub async fn run_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        if !self.db.claim_task(task_id)? {
            debug!("[Runner] Task {} was already claimed", task_id);
            return Ok(None);
        }
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        self.execute(task).await.map(Some)
    }

    /// 执行一个已认领（running）的任务
    async fn execute(&self, task: TaskRecord) -> Result<TaskRecord, StoreError> {
        info!(
            "[Runner] Task {} ({}) started",
            task.id,
            task.kind.as_str()
        );

        let sink = TaskSink::new(&self.live, &task.id);
        let mut verdict = self.perform(&task, &sink).await;
        if let (None, Some(e)) = (&verdict.error, sink.take_error()) {
            verdict = Verdict::failed(TaskFailure::new(
                FailureKind::Internal,
                format!("Failed to persist output: {}", e),
            ));
        }

        self.finalize(&task.id, verdict).await?;
        self.db
            .get_task(&task.id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task.id)))
    }

    async fn perform(&self, task: &TaskRecord, sink: &TaskSink<'_>) -> Verdict {
        let host = match task.host_id.as_deref() {
            Some(host_id) => match self.db.get_host(host_id) {
                Ok(Some(host)) => host,
                Ok(None) => {
                    return Verdict::failed(TaskFailure::new(
                        FailureKind::HostNotFound,
                        format!("Host {} no longer exists", host_id),
                    ))
                }
                Err(e) => {
                    return Verdict::failed(TaskFailure::new(
                        FailureKind::Internal,
                        format!("Failed to load host: {}", e),
                    ))
                }
            },
            None => {
                return Verdict::failed(TaskFailure::new(
                    FailureKind::HostNotFound,
                    "Host was deleted",
                ))
            }
        };

        // 凭据解密失败时不尝试连接
        let auth = match self.vault.auth_method(&host) {
            Ok(auth) => auth,
            Err(e) => {
                warn!("[Runner] Task {}: credential for {} unusable: {}", task.id, host.name, e);
                return Verdict::failed(TaskFailure::new(FailureKind::Authentication, e.to_string()));
            }
        };

        let session = match self.connector.connect(&host, auth).await {
            Ok(session) => session,
            Err(e) => return Verdict::failed(TaskFailure::from(&e)),
        };

        let ctx = OperationContext {
            session: session.as_ref(),
            sink,
            deploy: &self.deploy,
        };
        let operation = operation_for(task.kind);
        let result = self
            .with_heartbeat(&task.id, operation.run(&ctx, &task.params))
            .await;

        // 关闭失败只记录，不覆盖操作结果
        if let Err(e) = session.close().await {
            warn!("[Runner] Task {}: failed to close session: {}", task.id, e);
        }

        match result {
            Ok(outcome) => judge(outcome),
            Err(e) => {
                info!("[Runner] Task {} failed: {}", task.id, e);
                Verdict::failed(TaskFailure::from(&e))
            }
        }
    }

    /// 操作进行期间定期更新心跳
    async fn with_heartbeat<F: Future>(&self, task_id: &str, fut: F) -> F::Output {
        let period = Duration::from_secs(self.runner.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(fut);

        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => {
                    if let Err(e) = self.db.heartbeat(task_id) {
                        warn!("[Runner] Task {}: heartbeat failed: {}", task_id, e);
                    }
                }
            }
        }
    }

    /// 整理输出并写入终态
    async fn finalize(&self, task_id: &str, verdict: Verdict) -> Result<(), StoreError> {
        let chunks = self.db.collect_output(task_id)?;
        let bounded = bound_output(&chunks, self.output.inline_limit_bytes);

        let output_location = match &bounded.overflow {
            Some(full) => match self.artifacts.put(&artifact_key(task_id), full).await {
                Ok(location) => Some(location),
                Err(e) => {
                    error!("[Runner] Task {}: failed to store full output: {}", task_id, e);
                    None
                }
            },
            None => None,
        };

        let status = verdict.status();
        let fin = Finalization {
            status,
            stdout: bounded.stdout,
            stderr: bounded.stderr,
            output_location,
            result: verdict.result,
            error: verdict.error,
        };

        if self.db.finalize_task(task_id, &fin)? {
            info!("[Runner] Task {} finished: {}", task_id, status.as_str());
        } else {
            warn!("[Runner] Task {} was already finalized", task_id);
        }
        self.live.publish_done(task_id, status);
        Ok(())
    }

    /// 将心跳超时的 running 任务标记为失败
    pub async fn sweep_stale(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| StoreError::InvalidInput(e.to_string()))?;
        let stale = self.db.stale_running_tasks(Utc::now() - age)?;

        for task_id in &stale {
            warn!(
                "[Runner] Task {} has no heartbeat for {}s, marking failed",
                task_id,
                older_than.as_secs()
            );
            self.finalize(
                task_id,
                Verdict::failed(TaskFailure::new(
                    FailureKind::Stale,
                    format!("No heartbeat for {}s", older_than.as_secs()),
                )),
            )
            .await?;
        }
        Ok(stale)
    }
}

/// 根据命令退出状态判定成功与否
fn judge(outcome: TaskOutcome) -> Verdict {
    let failure = match &outcome {
        TaskOutcome::Command {
            exit_code: Some(0), ..
        }
        | TaskOutcome::Deploy { .. } => None,
        TaskOutcome::Command {
            exit_code: Some(code),
            ..
        } => Some(format!("Command exited with status {}", code)),
        TaskOutcome::Command { signal, .. } => Some(format!(
            "Command terminated by signal {}",
            signal.as_deref().unwrap_or("unknown")
        )),
    };

    Verdict {
        result: Some(outcome),
        error: failure.map(|m| TaskFailure::new(FailureKind::NonZeroExit, m)),
    }
}

/// 操作输出：持久化并推送给订阅者
struct TaskSink<'a> {
    live: &'a LiveOutputChannel,
    task_id: &'a str,
    error: Mutex<Option<StoreError>>,
}

impl<'a> TaskSink<'a> {
    fn new(live: &'a LiveOutputChannel, task_id: &'a str) -> Self {
        Self {
            live,
            task_id,
            error: Mutex::new(None),
        }
    }

    fn take_error(&self) -> Option<StoreError> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl OutputSink for TaskSink<'_> {
    fn emit(&self, stream: OutputStream, data: &[u8]) {
        if let Err(e) = self.live.publish(self.task_id, stream, data) {
            warn!("[Runner] Task {}: failed to persist output: {}", self.task_id, e);
            let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(e);
            }
        }
    }
}
