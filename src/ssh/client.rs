// SSH 客户端核心实现

use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::client::{AuthResult, Handle};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handler::{PresentedKey, SshClientHandler};
use super::session::SshSession;
use super::trust::HostTrust;

/// SSH 客户端
/// 负责建立 SSH 连接并返回 SshSession
pub struct SshClient {
    /// 连接配置
    config: SshConfig,
    /// 主机信任校验
    trust: Arc<HostTrust>,
}

impl SshClient {
    /// 创建新的 SSH 客户端
    pub fn new(config: SshConfig, trust: Arc<HostTrust>) -> Self {
        Self { config, trust }
    }

    /// 执行连接（异步）
    /// TCP 连接、握手、认证共用一个截止时间
    pub async fn connect(&self, session_id: String) -> Result<SshSession, SshError> {
        let connect_timeout = self.config.connect_timeout;
        let deadline = Instant::now() + Duration::from_secs(connect_timeout);
        let addr = self.config.address();

        debug!(
            "[SSH] Target: {}@{} (session {})",
            self.config.username, addr, session_id
        );

        // 解析地址并建立 TCP 连接
        let socket_addr = timeout_at(deadline, tokio::net::lookup_host(addr.clone()))
            .await
            .map_err(|_| SshError::ConnectTimeout(connect_timeout))?
            .map_err(|e| SshError::Connect(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SshError::Connect(format!("No valid address found for {}", addr)))?;

        let tcp_stream = timeout_at(deadline, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| SshError::ConnectTimeout(connect_timeout))?
            .map_err(|e| SshError::Connect(format!("{}: {}", socket_addr, e)))?;

        debug!("[SSH] TCP connection to {} established", socket_addr);

        // SSH 握手（首次连接时持有主机锁直到指纹持久化）
        let ticket = self.trust.begin(&self.config.host_id).await?;
        let expected = ticket.expected.clone();
        let presented = Arc::new(Mutex::new(None::<PresentedKey>));
        let handler = SshClientHandler::new(addr.clone(), expected.clone(), presented.clone());

        let russh_config = Arc::new(self.config.to_russh_config());
        let handshake = timeout_at(
            deadline,
            russh::client::connect_stream(russh_config, tcp_stream, handler),
        )
        .await
        .map_err(|_| SshError::ConnectTimeout(connect_timeout))?;

        let presented = presented
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let mut handle = match handshake {
            Ok(handle) => handle,
            Err(e) => {
                // Handler 拒绝了密钥时给出明确的指纹不匹配错误
                if let (Some(expected), Some(key)) = (expected, presented) {
                    if expected != key.fingerprint {
                        return Err(SshError::HostKeyMismatch {
                            expected,
                            actual: key.fingerprint,
                        });
                    }
                }
                return Err(SshError::from(e));
            }
        };

        let presented = presented
            .ok_or_else(|| SshError::Protocol("Server did not present a host key".to_string()))?;

        // 认证之前完成指纹校验/记录，凭据不会发送给未受信任的主机
        self.trust
            .admit(&self.config.host_id, ticket, &presented.fingerprint)?;

        debug!("[SSH] Authenticating as '{}'", self.config.username);
        timeout_at(deadline, self.authenticate(&mut handle))
            .await
            .map_err(|_| SshError::ConnectTimeout(connect_timeout))??;

        info!(
            "[SSH] Connected to {}@{} ({} {})",
            self.config.username, addr, presented.key_type, presented.fingerprint
        );

        Ok(SshSession::new(
            session_id,
            Arc::new(handle),
            self.config.host.clone(),
        ))
    }

    /// 执行认证
    async fn authenticate(&self, handle: &mut Handle<SshClientHandler>) -> Result<(), SshError> {
        let auth_result = match &self.config.auth {
            AuthMethod::Password(password) => {
                debug!("[SSH] Using password authentication");
                handle
                    .authenticate_password(&self.config.username, password.expose_secret())
                    .await
                    .map_err(SshError::from)?
            }
            AuthMethod::PrivateKey {
                key_data,
                passphrase,
            } => {
                debug!("[SSH] Using public key authentication");

                let key = russh::keys::decode_secret_key(
                    key_data.expose_secret(),
                    passphrase.as_ref().map(|p| p.expose_secret()),
                )
                .map_err(|e| SshError::Auth(format!("Failed to decode private key: {}", e)))?;

                // RSA 密钥选择服务器支持的最佳哈希算法
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();

                let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

                handle
                    .authenticate_publickey(&self.config.username, key_with_alg)
                    .await
                    .map_err(SshError::from)?
            }
        };

        match auth_result {
            AuthResult::Success => Ok(()),
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                if partial_success {
                    return Err(SshError::Auth(
                        "Partial authentication - additional auth required".to_string(),
                    ));
                }
                Err(SshError::Auth(format!(
                    "Authentication rejected for '{}'. Server suggests: {:?}",
                    self.config.username, remaining_methods
                )))
            }
        }
    }
}
