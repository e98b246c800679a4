// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait，负责主机指纹校验

use russh::keys::PublicKey;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// 握手时服务器出示的主机密钥信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresentedKey {
    /// 密钥类型（ssh-ed25519, ssh-rsa 等）
    pub key_type: String,
    /// SHA256 指纹
    pub fingerprint: String,
}

/// SSH 客户端 Handler
/// 已有记录时严格比对指纹；首次连接时只记录，由 HostTrust 负责持久化
pub struct SshClientHandler {
    /// 服务器地址（用于日志）
    host: String,
    /// 已存储的指纹（None 表示首次连接）
    expected: Option<String>,
    /// 握手过程中捕获的服务器密钥
    presented: Arc<Mutex<Option<PresentedKey>>>,
}

impl SshClientHandler {
    /// 创建新的 Handler
    pub fn new(
        host: String,
        expected: Option<String>,
        presented: Arc<Mutex<Option<PresentedKey>>>,
    ) -> Self {
        Self {
            host,
            expected,
            presented,
        }
    }
}

/// 指纹比对
pub fn fingerprint_accepted(expected: Option<&str>, actual: &str) -> bool {
    match expected {
        Some(expected) => expected == actual,
        None => true,
    }
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key
            .fingerprint(russh::keys::ssh_key::HashAlg::Sha256)
            .to_string();
        let key_type = server_public_key.algorithm().as_str().to_string();

        debug!(
            "[SSH] {} presented {} key {}",
            self.host, key_type, fingerprint
        );

        let accepted = fingerprint_accepted(self.expected.as_deref(), &fingerprint);
        if !accepted {
            warn!(
                "[SSH] Host key MISMATCH for {}: expected {:?}, got {}",
                self.host, self.expected, fingerprint
            );
        }

        *self.presented.lock().unwrap_or_else(|e| e.into_inner()) = Some(PresentedKey {
            key_type,
            fingerprint,
        });

        async move { Ok(accepted) }
    }
}
