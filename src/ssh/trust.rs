// 主机信任（TOFU）
//
// 首次连接记录服务器指纹，之后每次连接都必须完全一致。
// 同一主机的首次指纹写入按主机串行化，避免并发首连写入两个不同指纹。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use super::error::SshError;

/// 指纹存储
pub trait HostTrustStore: Send + Sync {
    /// 读取已记录的指纹
    fn get_fingerprint(&self, host_id: &str) -> Result<Option<String>, SshError>;

    /// 仅在尚无指纹时写入，返回是否写入成功
    fn set_fingerprint_if_absent(&self, host_id: &str, fingerprint: &str)
        -> Result<bool, SshError>;
}

/// 主机信任校验
pub struct HostTrust {
    store: Arc<dyn HostTrustStore>,
    /// 每个主机一把锁（仅首次连接时使用，无人持有时移除）
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// 连接前的信任状态
pub struct TrustTicket {
    /// 已存储的指纹
    pub expected: Option<String>,
    /// 首次连接时持有的主机锁，持久化完成后释放
    guard: Option<OwnedMutexGuard<()>>,
}

impl HostTrust {
    pub fn new(store: Arc<dyn HostTrustStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn host_lock(&self, host_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // 连接失败时票据未经 admit 直接丢弃，其锁在这里清理
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// 只剩表内引用时移除主机锁
    fn release(&self, host_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(host_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(host_id);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// 连接前调用：读取已存储指纹；首次连接时获取主机锁并在锁内重新读取
    pub async fn begin(&self, host_id: &str) -> Result<TrustTicket, SshError> {
        if let Some(expected) = self.store.get_fingerprint(host_id)? {
            return Ok(TrustTicket {
                expected: Some(expected),
                guard: None,
            });
        }

        let guard = self.host_lock(host_id).lock_owned().await;
        let expected = match self.store.get_fingerprint(host_id) {
            Ok(expected) => expected,
            Err(e) => {
                drop(guard);
                self.release(host_id);
                return Err(e);
            }
        };
        if expected.is_some() {
            // 等锁期间别的连接已写入指纹，不再需要持锁
            drop(guard);
            self.release(host_id);
            return Ok(TrustTicket {
                expected,
                guard: None,
            });
        }
        Ok(TrustTicket {
            expected,
            guard: Some(guard),
        })
    }

    /// 握手完成、认证之前调用：校验或记录服务器指纹
    pub fn admit(
        &self,
        host_id: &str,
        ticket: TrustTicket,
        presented: &str,
    ) -> Result<(), SshError> {
        let TrustTicket { expected, guard } = ticket;
        let result = self.verify(host_id, expected, presented);
        if let Some(guard) = guard {
            drop(guard);
            self.release(host_id);
        }
        result
    }

    fn verify(
        &self,
        host_id: &str,
        expected: Option<String>,
        presented: &str,
    ) -> Result<(), SshError> {
        match expected {
            Some(expected) if expected == presented => Ok(()),
            Some(expected) => Err(SshError::HostKeyMismatch {
                expected,
                actual: presented.to_string(),
            }),
            None => {
                if self.store.set_fingerprint_if_absent(host_id, presented)? {
                    info!("[SSH] Recorded host fingerprint for {}: {}", host_id, presented);
                    return Ok(());
                }
                // 其他进程抢先写入，按已存储指纹比对
                match self.store.get_fingerprint(host_id)? {
                    Some(stored) if stored == presented => Ok(()),
                    Some(stored) => {
                        warn!(
                            "[SSH] Fingerprint for {} was recorded concurrently and differs",
                            host_id
                        );
                        Err(SshError::HostKeyMismatch {
                            expected: stored,
                            actual: presented.to_string(),
                        })
                    }
                    None => Err(SshError::Config(format!(
                        "Host {} disappeared while recording fingerprint",
                        host_id
                    ))),
                }
            }
        }
    }
}
