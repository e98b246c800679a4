// SSH 连接启动器
// 由任务执行器调用：根据主机记录与解密后的凭据建立一次性会话

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::settings::ConnectionSettings;
use crate::models::Host;

use super::client::SshClient;
use super::config::{AuthMethod, KeepaliveConfig, SshConfig};
use super::error::SshError;
use super::transport::{RemoteSession, SessionConnector};
use super::trust::HostTrust;

/// 从主机记录构建 SshConfig
pub fn build_ssh_config(host: &Host, auth: AuthMethod, settings: &ConnectionSettings) -> SshConfig {
    SshConfig {
        host_id: host.id.clone(),
        host: host.hostname.clone(),
        port: host.port,
        username: host.username.clone(),
        auth,
        connect_timeout: settings.connect_timeout_secs,
        keepalive: KeepaliveConfig::from_settings(settings),
    }
}

/// 真实 SSH 连接器
/// 每次调用建立一个新连接，会话不在任务之间共享
pub struct SshConnector {
    settings: ConnectionSettings,
    trust: Arc<HostTrust>,
}

impl SshConnector {
    pub fn new(settings: ConnectionSettings, trust: Arc<HostTrust>) -> Self {
        Self { settings, trust }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(
        &self,
        host: &Host,
        auth: AuthMethod,
    ) -> Result<Box<dyn RemoteSession>, SshError> {
        let config = build_ssh_config(host, auth, &self.settings);
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "[SSH] [{}] Starting connection, session {}",
            host.name, session_id
        );

        let client = SshClient::new(config, self.trust.clone());
        match client.connect(session_id).await {
            Ok(session) => Ok(Box::new(session)),
            Err(e) => {
                warn!("[SSH] [{}] Connection failed: {}", host.name, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::host::AuthType;
    use secrecy::SecretString;

    #[test]
    fn test_build_ssh_config_uses_settings() {
        let host = Host {
            id: "h1".to_string(),
            name: "web-1".to_string(),
            hostname: "web-1.internal".to_string(),
            port: 2200,
            username: "ops".to_string(),
            auth_type: AuthType::Password,
            password_encrypted: Some(vec![1, 2, 3]),
            private_key_encrypted: None,
            passphrase_encrypted: None,
            fingerprint: None,
            created_at: chrono::Utc::now(),
        };
        let settings = ConnectionSettings {
            connect_timeout_secs: 7,
            keepalive_interval_secs: 0,
            keepalive_max: 0,
        };

        let config = build_ssh_config(
            &host,
            AuthMethod::Password(SecretString::from("pw".to_string())),
            &settings,
        );
        assert_eq!(config.host_id, "h1");
        assert_eq!(config.address(), "web-1.internal:2200");
        assert_eq!(config.username, "ops");
        assert_eq!(config.connect_timeout, 7);
        assert!(!config.keepalive.enabled);
    }
}
