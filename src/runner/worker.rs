// 执行器工作池
// 每个 worker 一次只处理一个任务；多个 worker 并行处理不同任务

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::TaskRunner;

/// 工作池
pub struct WorkerPool {
    runner: Arc<TaskRunner>,
    /// 同进程入队时唤醒空闲 worker
    wake: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self {
            runner,
            wake: Arc::new(Notify::new()),
        }
    }

    /// 入队通知句柄
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// 运行直到 shutdown 被取消；正在执行的任务会先完成
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) {
        let workers = workers.max(1);
        let poll = Duration::from_millis(self.runner.settings().poll_interval_ms.max(10));
        info!("[Runner] Starting {} workers", workers);

        let mut handles = Vec::with_capacity(workers + 1);
        for id in 0..workers {
            handles.push(tokio::spawn(worker_loop(
                id,
                self.runner.clone(),
                self.wake.clone(),
                poll,
                shutdown.clone(),
            )));
        }

        if let Some(secs) = self.runner.settings().stale_after_secs {
            handles.push(tokio::spawn(sweep_loop(
                self.runner.clone(),
                Duration::from_secs(secs),
                shutdown.clone(),
            )));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("[Runner] Worker task panicked: {}", e);
            }
        }
        info!("[Runner] All workers stopped");
    }
}

/// 单个 worker 的主循环
async fn worker_loop(
    id: usize,
    runner: Arc<TaskRunner>,
    wake: Arc<Notify>,
    poll: Duration,
    shutdown: CancellationToken,
) {
    info!("[Runner] Worker {} started", id);

    while !shutdown.is_cancelled() {
        match runner.run_next().await {
            // 处理完一个任务后立即查找下一个
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!("[Runner] Worker {}: store error: {}", id, e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }

    info!("[Runner] Worker {} stopped", id);
}

/// 定期清扫失去心跳的任务
async fn sweep_loop(runner: Arc<TaskRunner>, older_than: Duration, shutdown: CancellationToken) {
    let period = (older_than / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    info!(
        "[Runner] Stale sweep enabled: tasks without heartbeat for {}s are failed",
        older_than.as_secs()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match runner.sweep_stale(older_than).await {
                    Ok(swept) if !swept.is_empty() => {
                        info!("[Runner] Swept {} stale tasks", swept.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("[Runner] Stale sweep failed: {}", e),
                }
            }
        }
    }
}
