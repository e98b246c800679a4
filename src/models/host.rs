// Host, PublicKeyEntry 数据结构

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// 认证方式
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    Password,
    PrivateKey,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PrivateKey => "private_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "password" => Some(Self::Password),
            "private_key" => Some(Self::PrivateKey),
            _ => None,
        }
    }
}

/// 目标主机（持久化用）
/// 凭据只以密文形式保存，与 auth_type 对应的字段有且仅有一个
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    /// 唯一名称
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(skip)]
    pub password_encrypted: Option<Vec<u8>>,
    #[serde(skip)]
    pub private_key_encrypted: Option<Vec<u8>>,
    /// 私钥密码（可选，仅私钥认证）
    #[serde(skip)]
    pub passphrase_encrypted: Option<Vec<u8>>,
    /// 首次连接时记录的服务器指纹
    pub fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Host {
    /// 与认证方式匹配的凭据密文
    pub fn credential_blob(&self) -> Option<&[u8]> {
        match self.auth_type {
            AuthType::Password => self.password_encrypted.as_deref(),
            AuthType::PrivateKey => self.private_key_encrypted.as_deref(),
        }
    }
}

/// 注册主机时提交的明文凭据
#[derive(Debug)]
pub enum NewCredential {
    Password(SecretString),
    PrivateKey {
        key: SecretString,
        passphrase: Option<SecretString>,
    },
}

impl NewCredential {
    pub fn auth_type(&self) -> AuthType {
        match self {
            Self::Password(_) => AuthType::Password,
            Self::PrivateKey { .. } => AuthType::PrivateKey,
        }
    }
}

/// 主机注册请求
#[derive(Debug)]
pub struct NewHost {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub credential: NewCredential,
}

/// 命名公钥
/// 创建后不可修改，与主机无关联
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyEntry {
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_blob_matches_auth_type() {
        let mut host = Host {
            id: "h1".to_string(),
            name: "db".to_string(),
            hostname: "db.internal".to_string(),
            port: 22,
            username: "root".to_string(),
            auth_type: AuthType::PrivateKey,
            password_encrypted: None,
            private_key_encrypted: Some(vec![9, 9]),
            passphrase_encrypted: None,
            fingerprint: None,
            created_at: Utc::now(),
        };
        assert_eq!(host.credential_blob(), Some(&[9u8, 9][..]));

        host.auth_type = AuthType::Password;
        assert_eq!(host.credential_blob(), None);
    }

    #[test]
    fn test_auth_type_round_trip_names() {
        for t in [AuthType::Password, AuthType::PrivateKey] {
            assert_eq!(AuthType::parse(t.as_str()), Some(t));
        }
        assert_eq!(AuthType::parse("kerberos"), None);
    }

    #[test]
    fn test_host_serialization_omits_secrets() {
        let host = Host {
            id: "h1".to_string(),
            name: "db".to_string(),
            hostname: "db.internal".to_string(),
            port: 22,
            username: "root".to_string(),
            auth_type: AuthType::Password,
            password_encrypted: Some(vec![1, 2, 3]),
            private_key_encrypted: None,
            passphrase_encrypted: None,
            fingerprint: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&host).unwrap();
        assert!(!json.contains("password_encrypted"));
        assert!(json.contains("\"auth_type\":\"password\""));
    }
}
