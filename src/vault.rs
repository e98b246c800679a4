// 凭据加解密
//
// AES-256-GCM，密文格式: nonce(12 字节) || ciphertext+tag
// 解密结果只以 SecretString 形式存在，不写日志、不落盘

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;
use thiserror::Error;

use crate::models::{AuthType, Host, NewCredential};
use crate::ssh::AuthMethod;

/// 密钥环境变量（base64 编码的 32 字节密钥）
pub const VAULT_KEY_ENV: &str = "OCULTUM_VAULT_KEY";

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// 凭据加解密错误
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid vault key: {0}")]
    InvalidKey(String),

    #[error("Failed to decrypt credential")]
    Decryption,

    #[error("Failed to encrypt credential")]
    Encryption,

    #[error("Malformed credential: {0}")]
    Malformed(String),
}

/// 凭据库
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault([REDACTED])")
    }
}

/// 主机凭据的密文
#[derive(Debug, Default)]
pub struct EncryptedCredential {
    pub password: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<Vec<u8>>,
}

impl CredentialVault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// 从 base64 字符串加载密钥
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        Self::new(&key)
    }

    /// 从环境变量加载密钥
    pub fn from_env() -> Result<Self, VaultError> {
        let encoded = std::env::var(VAULT_KEY_ENV)
            .map_err(|_| VaultError::InvalidKey(format!("{} is not set", VAULT_KEY_ENV)))?;
        Self::from_base64(&encoded)
    }

    /// 生成新的随机密钥（base64）
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    /// 加密
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| VaultError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// 解密
    pub fn decrypt(&self, blob: &[u8]) -> Result<SecretString, VaultError> {
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::Malformed("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Decryption)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Malformed("credential is not valid UTF-8".to_string()))?;
        Ok(SecretString::from(text))
    }

    /// 加密注册请求中的明文凭据
    pub fn seal(&self, credential: &NewCredential) -> Result<EncryptedCredential, VaultError> {
        use secrecy::ExposeSecret;

        match credential {
            NewCredential::Password(password) => Ok(EncryptedCredential {
                password: Some(self.encrypt(password.expose_secret().as_bytes())?),
                ..Default::default()
            }),
            NewCredential::PrivateKey { key, passphrase } => Ok(EncryptedCredential {
                private_key: Some(self.encrypt(key.expose_secret().as_bytes())?),
                passphrase: passphrase
                    .as_ref()
                    .map(|p| self.encrypt(p.expose_secret().as_bytes()))
                    .transpose()?,
                ..Default::default()
            }),
        }
    }

    /// 为一次连接解密主机凭据
    pub fn auth_method(&self, host: &Host) -> Result<AuthMethod, VaultError> {
        let blob = host.credential_blob().ok_or_else(|| {
            VaultError::Malformed(format!(
                "host '{}' has no {} credential",
                host.name,
                host.auth_type.as_str()
            ))
        })?;

        match host.auth_type {
            AuthType::Password => Ok(AuthMethod::Password(self.decrypt(blob)?)),
            AuthType::PrivateKey => Ok(AuthMethod::PrivateKey {
                key_data: self.decrypt(blob)?,
                passphrase: host
                    .passphrase_encrypted
                    .as_deref()
                    .map(|p| self.decrypt(p))
                    .transpose()?,
            }),
        }
    }
}
