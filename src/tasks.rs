// 任务入口
//
// 主机登记、公钥目录与任务的入队/查询/订阅。
// 入队只写入 pending 记录并立即返回 id，执行由 runner 完成。

use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::live::{LiveOutputChannel, StreamEvent};
use crate::models::settings::RunnerSettings;
use crate::models::{Host, NewHost, PublicKeyEntry, TaskParams, TaskRecord};
use crate::store::{Database, StoreError};
use crate::vault::{CredentialVault, VaultError};

/// 入队与查询错误
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Public key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Credential error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 检查一行 OpenSSH 公钥："<类型> <base64> [注释]"
pub fn validate_public_key(key: &str) -> Result<String, TaskError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(TaskError::InvalidRequest("public key is empty".to_string()));
    }
    if key.contains('\n') || key.contains('\r') {
        return Err(TaskError::InvalidRequest(
            "public key must be a single line".to_string(),
        ));
    }

    let mut fields = key.split_whitespace();
    let algo = fields.next().unwrap_or_default();
    let known = algo.starts_with("ssh-") || algo.starts_with("ecdsa-") || algo.starts_with("sk-");
    if !known || fields.next().is_none() {
        return Err(TaskError::InvalidRequest(format!(
            "not an OpenSSH public key: {}",
            key.chars().take(32).collect::<String>()
        )));
    }
    Ok(key.to_string())
}

/// 任务服务
pub struct TaskService {
    db: Arc<Database>,
    live: Arc<LiveOutputChannel>,
    runner: RunnerSettings,
    /// 仅登记主机时需要
    vault: Option<Arc<CredentialVault>>,
    /// 同进程 worker 的唤醒句柄
    wake: Option<Arc<Notify>>,
}

impl TaskService {
    pub fn new(db: Arc<Database>, live: Arc<LiveOutputChannel>, runner: RunnerSettings) -> Self {
        Self {
            db,
            live,
            runner,
            vault: None,
            wake: None,
        }
    }

    pub fn with_vault(mut self, vault: Arc<CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// 入队后唤醒同进程的 worker
    pub fn with_waker(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    // ======================== 主机 ========================

    /// 登记主机，凭据加密后保存
    pub fn register_host(&self, new: NewHost) -> Result<Host, TaskError> {
        let name = new.name.trim();
        if name.is_empty() || new.hostname.trim().is_empty() || new.username.trim().is_empty() {
            return Err(TaskError::InvalidRequest(
                "name, hostname and username are required".to_string(),
            ));
        }
        if new.port == 0 {
            return Err(TaskError::InvalidRequest("port must be non-zero".to_string()));
        }

        let vault = self.vault.as_ref().ok_or_else(|| {
            VaultError::InvalidKey("no credential key configured".to_string())
        })?;
        let sealed = vault.seal(&new.credential)?;
        let host = Host {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            hostname: new.hostname.trim().to_string(),
            port: new.port,
            username: new.username.trim().to_string(),
            auth_type: new.credential.auth_type(),
            password_encrypted: sealed.password,
            private_key_encrypted: sealed.private_key,
            passphrase_encrypted: sealed.passphrase,
            fingerprint: None,
            created_at: Utc::now(),
        };
        self.db.insert_host(&host)?;
        info!("[Store] Registered host {} ({})", host.name, host.id);
        Ok(host)
    }

    /// 按 id 或名称查找主机
    pub fn get_host(&self, reference: &str) -> Result<Host, TaskError> {
        self.db
            .find_host(reference)?
            .ok_or_else(|| TaskError::HostNotFound(reference.to_string()))
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>, TaskError> {
        Ok(self.db.list_hosts()?)
    }

    /// 删除主机；已有任务保留，执行时报告主机不存在
    pub fn delete_host(&self, reference: &str) -> Result<(), TaskError> {
        let host = self.get_host(reference)?;
        self.db.delete_host(&host.id)?;
        info!("[Store] Deleted host {} ({})", host.name, host.id);
        Ok(())
    }

    // ======================== 公钥目录 ========================

    pub fn add_public_key(&self, name: &str, public_key: &str) -> Result<PublicKeyEntry, TaskError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TaskError::InvalidRequest("key name is required".to_string()));
        }
        let entry = PublicKeyEntry {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            public_key: validate_public_key(public_key)?,
            created_at: Utc::now(),
        };
        self.db.insert_public_key(&entry)?;
        Ok(entry)
    }

    pub fn list_public_keys(&self) -> Result<Vec<PublicKeyEntry>, TaskError> {
        Ok(self.db.list_public_keys()?)
    }

    pub fn delete_public_key(&self, reference: &str) -> Result<(), TaskError> {
        let entry = self
            .db
            .get_public_key(reference)?
            .ok_or_else(|| TaskError::KeyNotFound(reference.to_string()))?;
        self.db.delete_public_key(&entry.id)?;
        Ok(())
    }

    // ======================== 入队 ========================

    /// 部署给定公钥，返回任务 id
    pub fn enqueue_deploy(&self, host: &str, keys: &[String]) -> Result<String, TaskError> {
        if keys.is_empty() {
            return Err(TaskError::InvalidRequest("no keys to deploy".to_string()));
        }
        let mut validated: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let key = validate_public_key(key)?;
            if !validated.contains(&key) {
                validated.push(key);
            }
        }
        self.enqueue(host, TaskParams::DeployKeys { keys: validated })
    }

    /// 部署公钥目录中的条目；None 表示全部条目
    pub fn enqueue_deploy_entries(
        &self,
        host: &str,
        key_refs: Option<&[String]>,
    ) -> Result<String, TaskError> {
        let keys = match key_refs {
            None => self
                .db
                .list_public_keys()?
                .into_iter()
                .map(|e| e.public_key)
                .collect(),
            Some(refs) => self.resolve_public_keys(refs)?,
        };
        self.enqueue_deploy(host, &keys)
    }

    /// 按 id 或名称取出公钥内容
    pub fn resolve_public_keys(&self, key_refs: &[String]) -> Result<Vec<String>, TaskError> {
        key_refs
            .iter()
            .map(|r| {
                self.db
                    .get_public_key(r)?
                    .map(|e| e.public_key)
                    .ok_or_else(|| TaskError::KeyNotFound(r.clone()))
            })
            .collect()
    }

    /// 执行命令，返回任务 id；timeout 缺省时使用默认值
    pub fn enqueue_command(
        &self,
        host: &str,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<String, TaskError> {
        if command.trim().is_empty() {
            return Err(TaskError::InvalidRequest("command is empty".to_string()));
        }
        let timeout_secs = timeout_secs.unwrap_or(self.runner.default_command_timeout_secs);
        if timeout_secs == 0 || timeout_secs > self.runner.max_command_timeout_secs {
            return Err(TaskError::InvalidRequest(format!(
                "timeout must be between 1 and {} seconds",
                self.runner.max_command_timeout_secs
            )));
        }
        self.enqueue(
            host,
            TaskParams::RunCommand {
                command: command.to_string(),
                timeout_secs,
            },
        )
    }

    fn enqueue(&self, host: &str, params: TaskParams) -> Result<String, TaskError> {
        let host = self.get_host(host)?;
        let task = self.db.create_task(&host.id, &params)?;
        info!(
            "[Runner] Enqueued task {} ({}) for host {}",
            task.id,
            task.kind.as_str(),
            host.name
        );
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
        Ok(task.id)
    }

    // ======================== 查询 ========================

    pub fn query_task(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))
    }

    /// 最近创建的任务
    pub fn recent_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self.db.list_tasks(limit)?)
    }

    /// 订阅任务输出；任务不存在时立即报错
    pub fn stream_task(
        &self,
        task_id: &str,
    ) -> Result<impl Stream<Item = Result<StreamEvent, StoreError>> + Send + 'static, TaskError>
    {
        if self.db.task_status(task_id)?.is_none() {
            return Err(TaskError::TaskNotFound(task_id.to_string()));
        }
        Ok(self.live.subscribe(task_id))
    }
}
