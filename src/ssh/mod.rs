// SSH 传输模块
//
// 模块结构:
// - config: 连接配置 (SshConfig, AuthMethod)
// - error: 错误类型 (SshError)
// - event: 命令输出事件 (OutputStream, ExitResult, OutputSink)
// - handler: russh Handler 实现（捕获服务器指纹）
// - trust: 主机信任 (HostTrust, HostTrustStore)
// - client: SSH 客户端核心（连接、认证）
// - session: SSH 会话 (SshSession)
// - transport: 传输抽象 (RemoteSession, SessionConnector, atomic_write_file)
// - connector: 按主机记录建立会话 (SshConnector)

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
pub mod handler;
pub mod session;
pub mod transport;
pub mod trust;

// 公开导出
pub use client::SshClient;
pub use config::{AuthMethod, KeepaliveConfig, SshConfig};
pub use connector::SshConnector;
pub use error::SshError;
pub use event::{ExitResult, OutputSink, OutputStream};
pub use session::SshSession;
pub use transport::{atomic_write_file, RemoteSession, SessionConnector};
pub use trust::{HostTrust, HostTrustStore};
