// SSH 错误类型定义

use thiserror::Error;

/// SSH 错误类型
#[derive(Debug, Error)]
pub enum SshError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 认证失败（凭据错误或凭据解密失败）
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 主机指纹与已记录的不一致
    #[error("Host key verification failed: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    /// 连接超时
    #[error("Connection timeout after {0}s")]
    ConnectTimeout(u64),

    /// 无法建立连接（解析失败、拒绝连接等）
    #[error("Connect error: {0}")]
    Connect(String),

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// 密钥错误
    #[error("Key error: {0}")]
    Key(String),

    /// 通道错误
    #[error("Channel error: {0}")]
    Channel(String),

    /// 远程文件不存在
    #[error("No such file: {0}")]
    NotFound(String),

    /// 远程权限不足
    #[error("Permission denied: {0}")]
    Permission(String),

    /// 远程文件系统 IO 错误
    #[error("IO error: {0}")]
    Io(String),

    /// 命令执行超时（远程进程已被终止）
    #[error("Command timed out after {0}s")]
    Timeout(u64),

    /// 操作过程中连接中断
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl From<std::io::Error> for SshError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => SshError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => SshError::Permission(e.to_string()),
            _ => SshError::Io(e.to_string()),
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => {
                SshError::ConnectionLost(e.to_string())
            }
            russh::Error::UnknownKey => SshError::HostKeyMismatch {
                expected: "stored fingerprint".to_string(),
                actual: "unrecognized server key".to_string(),
            },
            other => SshError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::Key(e.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for SshError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error as SftpError;
        use russh_sftp::protocol::StatusCode;

        match e {
            SftpError::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => SshError::NotFound(status.error_message),
                StatusCode::PermissionDenied => SshError::Permission(status.error_message),
                StatusCode::NoConnection | StatusCode::ConnectionLost => {
                    SshError::ConnectionLost(status.error_message)
                }
                _ => SshError::Io(status.error_message),
            },
            other => SshError::Io(other.to_string()),
        }
    }
}
