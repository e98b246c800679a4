// SSH 传输层抽象
//
// 操作（部署密钥、执行命令）只依赖这里的 trait，
// 真实实现是 SshSession / SshConnector，测试中使用内存实现。

use async_trait::async_trait;
use tracing::{debug, warn};

use super::config::AuthMethod;
use super::error::SshError;
use super::event::{ExitResult, OutputSink};
use crate::models::Host;

/// 一个已认证的远程会话
/// 生命周期限定在单个任务内，不跨任务复用
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// 读取远程文件全部内容
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SshError>;

    /// 创建（或截断）文件并写入内容，随后设置权限位
    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), SshError>;

    /// 原子重命名，目标存在时直接替换
    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError>;

    /// 删除文件
    async fn remove_file(&self, path: &str) -> Result<(), SshError>;

    /// 递归创建目录，并将最终目录权限设为 mode
    async fn create_dir_all(&self, path: &str, mode: u32) -> Result<(), SshError>;

    /// 执行命令，输出按到达顺序推送给 sink；超时则终止远程进程并返回 Timeout
    async fn run_command(
        &self,
        command: &str,
        timeout_secs: u64,
        sink: &dyn OutputSink,
    ) -> Result<ExitResult, SshError>;

    /// 关闭会话
    async fn close(&self) -> Result<(), SshError>;
}

/// 会话建立器
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        host: &Host,
        auth: AuthMethod,
    ) -> Result<Box<dyn RemoteSession>, SshError>;
}

/// 原子写文件
///
/// 先写入同目录下的临时文件并设置权限，再 rename 覆盖目标。
/// 任何读者只会看到完整的旧内容或完整的新内容；中途失败时原文件保持不变。
pub async fn atomic_write_file(
    session: &dyn RemoteSession,
    path: &str,
    content: &[u8],
    mode: u32,
) -> Result<(), SshError> {
    let tmp_path = temp_sibling(path);
    debug!("[SSH] Atomic write {} via {}", path, tmp_path);

    if let Err(e) = session.write_file(&tmp_path, content, mode).await {
        cleanup_temp(session, &tmp_path).await;
        return Err(e);
    }

    if let Err(e) = session.rename(&tmp_path, path).await {
        cleanup_temp(session, &tmp_path).await;
        return Err(e);
    }

    Ok(())
}

async fn cleanup_temp(session: &dyn RemoteSession, tmp_path: &str) {
    if let Err(e) = session.remove_file(tmp_path).await {
        warn!("[SSH] Failed to remove temp file {}: {}", tmp_path, e);
    }
}

/// 生成与目标同目录的临时文件路径
pub fn temp_sibling(path: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{}/.{}.tmp-{}", dir, name, &suffix[..12]),
        None => format!(".{}.tmp-{}", path, &suffix[..12]),
    }
}

/// 取路径的父目录（没有父目录时返回 None）
pub fn parent_dir(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((dir, _)) => Some(dir),
        None => None,
    }
}

/// POSIX shell 单引号转义
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
