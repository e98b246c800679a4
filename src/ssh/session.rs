// SSH 会话管理
// 连接成功后的会话对象，提供文件读写与命令执行

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh::{ChannelMsg, Disconnect, Sig};
use tokio::sync::OnceCell;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::event::{ExitResult, OutputSink, OutputStream};
use super::handler::SshClientHandler;
use super::transport::{shell_quote, RemoteSession};
use crate::services::sftp::SftpService;

/// 远程进程被终止后等待通道关闭的时间
const KILL_GRACE: Duration = Duration::from_secs(2);

/// SSH 会话（连接成功后）
pub struct SshSession {
    /// 会话 ID
    id: String,
    /// russh Handle
    handle: Arc<Handle<SshClientHandler>>,
    /// 服务器主机名
    host: String,
    /// 连接状态
    is_connected: AtomicBool,
    /// 按需打开的 SFTP 子系统
    sftp: OnceCell<SftpService>,
}

impl SshSession {
    /// 创建新的会话
    pub fn new(
        id: String,
        handle: Arc<Handle<SshClientHandler>>,
        host: String,
    ) -> Self {
        Self {
            id,
            handle,
            host,
            is_connected: AtomicBool::new(true),
            sftp: OnceCell::new(),
        }
    }

    /// 检查会话是否活跃
    pub fn is_alive(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed) && !self.handle.is_closed()
    }

    fn ensure_alive(&self) -> Result<(), SshError> {
        if !self.is_alive() {
            return Err(SshError::ConnectionLost(
                "Session is disconnected".to_string(),
            ));
        }
        Ok(())
    }

    async fn sftp(&self) -> Result<&SftpService, SshError> {
        self.ensure_alive()?;
        self.sftp
            .get_or_try_init(|| SftpService::open(self.id.clone(), &self.handle))
            .await
    }

    /// 执行辅助命令，非零退出码转换为文件系统错误
    async fn exec_checked(&self, command: &str) -> Result<(), SshError> {
        let stderr = CollectSink::default();
        let result = self.exec_streaming(command, 30, &stderr).await?;
        if result.is_success() {
            return Ok(());
        }
        let message = String::from_utf8_lossy(&stderr.take()).trim().to_string();
        Err(classify_fs_failure(message, result.exit_code))
    }

    /// 在新的 exec 通道上运行命令，输出逐块推送
    async fn exec_streaming(
        &self,
        command: &str,
        timeout_secs: u64,
        sink: &dyn OutputSink,
    ) -> Result<ExitResult, SshError> {
        self.ensure_alive()?;

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;

        let mut exit_code = None;
        let mut signal = None;
        let mut output_bytes = 0u64;

        loop {
            let msg = match timeout_at(deadline, channel.wait()).await {
                Ok(msg) => msg,
                Err(_) => {
                    warn!(
                        "[SSH] [{}] Command exceeded {}s, terminating",
                        self.host, timeout_secs
                    );
                    let _ = channel.signal(Sig::KILL).await;
                    let _ = tokio::time::timeout(KILL_GRACE, channel.close()).await;
                    // 关闭整个会话，确保远程进程收到 SIGHUP
                    self.disconnect("command timeout").await;
                    return Err(SshError::Timeout(timeout_secs));
                }
            };

            match msg {
                Some(ChannelMsg::Data { data }) => {
                    output_bytes += data.len() as u64;
                    sink.emit(OutputStream::Stdout, &data);
                }
                // 扩展数据（ext == 1 为 stderr）
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    output_bytes += data.len() as u64;
                    sink.emit(OutputStream::Stderr, &data);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    signal = Some(format!("{:?}", signal_name));
                }
                // EOF 之后仍可能收到 exit-status，等到通道关闭
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        if exit_code.is_none() && signal.is_none() {
            self.mark_disconnected();
            return Err(SshError::ConnectionLost(format!(
                "Channel closed before command '{}' reported an exit status",
                command
            )));
        }

        Ok(ExitResult {
            exit_code,
            signal,
            output_bytes,
        })
    }

    /// 标记会话断开
    pub fn mark_disconnected(&self) {
        self.is_connected.store(false, Ordering::Relaxed);
    }

    async fn disconnect(&self, reason: &str) {
        self.mark_disconnected();
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, reason, "en")
            .await
        {
            debug!("[SSH] Disconnect of session {} failed: {}", self.id, e);
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SshError> {
        self.sftp().await?.read_file(path).await
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), SshError> {
        self.sftp().await?.write_file(path, content, mode).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        // SFTP v3 的 rename 在目标存在时失败，这里使用 rename(2) 语义的 mv -f
        self.exec_checked(&format!("mv -f -- {} {}", shell_quote(from), shell_quote(to)))
            .await
    }

    async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        self.sftp().await?.remove_file(path).await
    }

    async fn create_dir_all(&self, path: &str, mode: u32) -> Result<(), SshError> {
        let quoted = shell_quote(path);
        self.exec_checked(&format!(
            "mkdir -p -- {q} && chmod {mode:o} -- {q}",
            q = quoted,
            mode = mode
        ))
        .await
    }

    async fn run_command(
        &self,
        command: &str,
        timeout_secs: u64,
        sink: &dyn OutputSink,
    ) -> Result<ExitResult, SshError> {
        debug!("[SSH] [{}] Executing: {}", self.host, command);
        self.exec_streaming(command, timeout_secs, sink).await
    }

    async fn close(&self) -> Result<(), SshError> {
        if let Some(sftp) = self.sftp.get() {
            sftp.close().await;
        }
        if self.is_connected.swap(false, Ordering::Relaxed) {
            self.handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(SshError::from)?;
            info!("[SSH] Session {} to {} closed", self.id, self.host);
        }
        Ok(())
    }
}

/// 收集 stderr 用于辅助命令的错误信息
#[derive(Default)]
struct CollectSink {
    stderr: std::sync::Mutex<Vec<u8>>,
}

impl CollectSink {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.stderr.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl OutputSink for CollectSink {
    fn emit(&self, stream: OutputStream, data: &[u8]) {
        if stream == OutputStream::Stderr {
            self.stderr
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(data);
        }
    }
}

/// 根据辅助命令的 stderr 区分权限错误与一般 IO 错误
fn classify_fs_failure(message: String, exit_code: Option<u32>) -> SshError {
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        SshError::Permission(message)
    } else if lower.contains("no such file") {
        SshError::NotFound(message)
    } else if message.is_empty() {
        SshError::Io(format!("Remote command failed with status {:?}", exit_code))
    } else {
        SshError::Io(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_fs_failure() {
        assert!(matches!(
            classify_fs_failure("mv: cannot move: Permission denied".into(), Some(1)),
            SshError::Permission(_)
        ));
        assert!(matches!(
            classify_fs_failure("mkdir: No such file or directory".into(), Some(1)),
            SshError::NotFound(_)
        ));
        assert!(matches!(
            classify_fs_failure(String::new(), Some(2)),
            SshError::Io(_)
        ));
        assert!(matches!(
            classify_fs_failure("disk quota exceeded".into(), Some(1)),
            SshError::Io(_)
        ));
    }
}
