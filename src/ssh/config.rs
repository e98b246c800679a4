// SSH 连接配置

use secrecy::SecretString;

use crate::models::settings::ConnectionSettings;

/// SSH 连接配置
/// 仅在单个任务执行期间存在，任务结束即丢弃（凭据随之清零）
#[derive(Debug)]
pub struct SshConfig {
    /// 主机 ID（用于指纹记录）
    pub host_id: String,
    /// 目标主机
    pub host: String,
    /// 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式
    pub auth: AuthMethod,
    /// 连接超时（秒）
    pub connect_timeout: u64,
    /// 心跳配置
    pub keepalive: KeepaliveConfig,
}

/// 认证方式（已解密的凭据）
#[derive(Debug)]
pub enum AuthMethod {
    /// 密码认证
    Password(SecretString),
    /// 私钥认证
    PrivateKey {
        /// PEM/OpenSSH 格式私钥内容
        key_data: SecretString,
        /// 私钥密码（如果有）
        passphrase: Option<SecretString>,
    },
}

/// 心跳配置
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 心跳间隔（秒）
    pub interval: u64,
    /// 最大重试次数
    pub max_retries: u32,
}

impl KeepaliveConfig {
    /// 从连接设置构建
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            enabled: settings.keepalive_interval_secs > 0,
            interval: settings.keepalive_interval_secs,
            max_retries: settings.keepalive_max,
        }
    }
}

/// russh 客户端配置构建
impl SshConfig {
    /// 构建 russh 配置
    pub fn to_russh_config(&self) -> russh::client::Config {
        let mut config = russh::client::Config::default();
        // 命令可能长时间无输出，不设置不活动超时，由心跳检测断线
        config.inactivity_timeout = None;
        if self.keepalive.enabled {
            config.keepalive_interval =
                Some(std::time::Duration::from_secs(self.keepalive.interval));
            config.keepalive_max = self.keepalive.max_retries as usize;
        }
        config
    }

    /// 目标地址（host:port）
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(keepalive: KeepaliveConfig) -> SshConfig {
        SshConfig {
            host_id: "h1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 2222,
            username: "deploy".to_string(),
            auth: AuthMethod::Password(SecretString::from("pw".to_string())),
            connect_timeout: 10,
            keepalive,
        }
    }

    fn keepalive(interval: u64) -> KeepaliveConfig {
        KeepaliveConfig::from_settings(&ConnectionSettings {
            keepalive_interval_secs: interval,
            keepalive_max: 3,
            ..ConnectionSettings::default()
        })
    }

    #[test]
    fn test_russh_config_keepalive() {
        let c = config(keepalive(30)).to_russh_config();
        assert_eq!(c.keepalive_interval, Some(std::time::Duration::from_secs(30)));
        assert_eq!(c.keepalive_max, 3);
        assert!(c.inactivity_timeout.is_none());

        // 间隔为 0 表示关闭心跳
        let disabled = keepalive(0);
        assert!(!disabled.enabled);
        assert!(config(disabled).to_russh_config().keepalive_interval.is_none());
    }

    #[test]
    fn test_address_and_redacted_debug() {
        let c = config(keepalive(30));
        assert_eq!(c.address(), "10.0.0.5:2222");
        assert!(!format!("{:?}", c.auth).contains("pw\""));
    }
}
