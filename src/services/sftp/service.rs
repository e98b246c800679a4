// SFTP 服务 - 封装 russh-sftp 客户端

use std::sync::Arc;

use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::ssh::handler::SshClientHandler;
use crate::ssh::SshError;

/// SFTP 服务
/// 封装 russh-sftp 客户端，提供文件操作接口
pub struct SftpService {
    /// 会话 ID
    session_id: String,
    /// russh-sftp 客户端会话
    sftp: SftpSession,
}

impl SftpService {
    /// 在已认证的连接上打开 SFTP 子系统
    pub async fn open(
        session_id: String,
        handle: &Arc<Handle<SshClientHandler>>,
    ) -> Result<Self, SshError> {
        debug!("[SFTP] Opening SFTP subsystem for session {}", session_id);

        // 打开会话通道
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(format!("Failed to open channel: {}", e)))?;

        // 请求 SFTP 子系统
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Channel(format!("Failed to request sftp subsystem: {}", e)))?;

        // 使用 russh-sftp 包装通道
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Channel(format!("Failed to create SFTP session: {}", e)))?;

        info!("[SFTP] SFTP subsystem ready for session {}", session_id);

        Ok(Self { session_id, sftp })
    }

    /// 读取文件内容
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, SshError> {
        debug!("[SFTP] Reading file: {}", path);

        let mut file = self.sftp.open(path).await.map_err(SshError::from)?;

        let mut content = Vec::new();
        file.read_to_end(&mut content).await.map_err(SshError::from)?;

        debug!("[SFTP] Read {} bytes from {}", content.len(), path);
        Ok(content)
    }

    /// 创建（或截断）文件并写入内容，然后设置权限
    pub async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), SshError> {
        debug!("[SFTP] Writing {} bytes to {}", content.len(), path);

        let mut file = self.sftp.create(path).await.map_err(SshError::from)?;
        file.write_all(content).await.map_err(SshError::from)?;
        file.flush().await.map_err(SshError::from)?;
        file.shutdown().await.map_err(SshError::from)?;

        // 只设置权限位，其余属性保持不变
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(SshError::from)?;

        Ok(())
    }

    /// 删除文件
    pub async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        debug!("[SFTP] Removing file: {}", path);
        self.sftp.remove_file(path).await.map_err(SshError::from)
    }

    /// 关闭 SFTP 子系统
    pub async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            warn!(
                "[SFTP] Failed to close SFTP session {}: {}",
                self.session_id, e
            );
        }
    }
}

impl Drop for SftpService {
    fn drop(&mut self) {
        debug!(
            "[SFTP] Dropping SFTP service for session {}",
            self.session_id
        );
    }
}
