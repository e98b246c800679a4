// 测试辅助：内存会话、连接器与输出接收器
// 仅在测试时编译

#![cfg(test)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{AuthType, Host};
use crate::ssh::transport::parent_dir;
use crate::ssh::{
    AuthMethod, ExitResult, OutputSink, OutputStream, RemoteSession, SessionConnector, SshError,
};
use crate::vault::CredentialVault;

// ============================================================================
// 主机与凭据
// ============================================================================

/// 测试用凭据库
pub fn test_vault() -> CredentialVault {
    CredentialVault::new(&[7u8; 32]).unwrap()
}

/// 密码认证主机（凭据为占位密文）
pub fn password_host(id: &str, name: &str) -> Host {
    Host {
        id: id.to_string(),
        name: name.to_string(),
        hostname: format!("{}.test", name),
        port: 22,
        username: "deploy".to_string(),
        auth_type: AuthType::Password,
        password_encrypted: Some(vec![1, 2, 3]),
        private_key_encrypted: None,
        passphrase_encrypted: None,
        fingerprint: None,
        created_at: Utc::now(),
    }
}

/// 凭据可由 test_vault 解密的主机
pub fn sealed_host(id: &str, name: &str) -> Host {
    let mut host = password_host(id, name);
    host.password_encrypted = Some(test_vault().encrypt(b"s3cret").unwrap());
    host
}

// ============================================================================
// 命令脚本
// ============================================================================

#[derive(Clone, Debug)]
enum Step {
    Out(OutputStream, Vec<u8>),
    Sleep(Duration),
}

/// 内存会话中一条命令的行为
#[derive(Clone, Debug, Default)]
pub struct Script {
    steps: Vec<Step>,
    exit: Option<u32>,
    drop_connection: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, data: &str) -> Self {
        self.steps
            .push(Step::Out(OutputStream::Stdout, data.as_bytes().to_vec()));
        self
    }

    pub fn stderr(mut self, data: &str) -> Self {
        self.steps
            .push(Step::Out(OutputStream::Stderr, data.as_bytes().to_vec()));
        self
    }

    pub fn sleep_secs(mut self, secs: u64) -> Self {
        self.steps.push(Step::Sleep(Duration::from_secs(secs)));
        self
    }

    pub fn exit(mut self, code: u32) -> Self {
        self.exit = Some(code);
        self
    }

    /// 执行完步骤后连接中断
    pub fn drop_connection(mut self) -> Self {
        self.drop_connection = true;
        self
    }
}

// ============================================================================
// 内存会话
// ============================================================================

/// 注入的故障（只触发一次）
#[derive(Debug)]
pub enum Fault {
    Read(SshError),
    Write,
    Rename,
    Close,
}

#[derive(Default)]
struct SessionState {
    files: BTreeMap<String, (Vec<u8>, u32)>,
    dirs: BTreeMap<String, u32>,
    scripts: HashMap<String, Script>,
    faults: Vec<Fault>,
    writes: usize,
    commands: Vec<String>,
    closes: usize,
}

/// 内存中的远程主机
/// 文件与脚本在 fork 出的会话之间共享，关闭状态各自独立
#[derive(Clone, Default)]
pub struct MemorySession {
    state: Arc<Mutex<SessionState>>,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一主机上的新连接
    pub fn fork(&self) -> Self {
        Self {
            state: self.state.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    pub fn put_file(&self, path: &str, content: &str, mode: u32) {
        self.put_bytes(path, content.as_bytes(), mode);
    }

    pub fn put_bytes(&self, path: &str, content: &[u8], mode: u32) {
        let mut state = self.state();
        if let Some(dir) = parent_dir(path) {
            state.dirs.entry(dir.to_string()).or_insert(0o755);
        }
        state
            .files
            .insert(path.to_string(), (content.to_vec(), mode));
    }

    pub fn file_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|(data, _)| data.clone())
    }

    pub fn script(&self, command: &str, script: Script) {
        self.state().scripts.insert(command.to_string(), script);
    }

    pub fn fail_next(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    pub fn file_text(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|(data, _)| String::from_utf8(data.clone()).unwrap())
    }

    pub fn file_mode(&self, path: &str) -> Option<u32> {
        self.state().files.get(path).map(|(_, mode)| *mode)
    }

    pub fn dir_mode(&self, path: &str) -> Option<u32> {
        self.state().dirs.get(path).copied()
    }

    /// 所有文件路径（有序）
    pub fn paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// 所有连接累计的 close 调用次数
    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    fn take_fault(&self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut state = self.state();
        let pos = state.faults.iter().position(pred)?;
        Some(state.faults.remove(pos))
    }

    fn ensure_open(&self) -> Result<(), SshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionLost("session closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SshError> {
        self.ensure_open()?;
        if let Some(Fault::Read(e)) = self.take_fault(|f| matches!(f, Fault::Read(_))) {
            return Err(e);
        }
        self.state()
            .files
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| SshError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), SshError> {
        self.ensure_open()?;
        if self.take_fault(|f| matches!(f, Fault::Write)).is_some() {
            return Err(SshError::Io(format!("write to {} failed", path)));
        }
        let mut state = self.state();
        if let Some(dir) = parent_dir(path) {
            if !state.dirs.contains_key(dir) {
                return Err(SshError::NotFound(dir.to_string()));
            }
        }
        state.writes += 1;
        state
            .files
            .insert(path.to_string(), (content.to_vec(), mode));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        self.ensure_open()?;
        if self.take_fault(|f| matches!(f, Fault::Rename)).is_some() {
            return Err(SshError::Io(format!("rename {} -> {} interrupted", from, to)));
        }
        let mut state = self.state();
        let entry = state
            .files
            .remove(from)
            .ok_or_else(|| SshError::NotFound(from.to_string()))?;
        state.files.insert(to.to_string(), entry);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        self.ensure_open()?;
        self.state()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| SshError::NotFound(path.to_string()))
    }

    async fn create_dir_all(&self, path: &str, mode: u32) -> Result<(), SshError> {
        self.ensure_open()?;
        self.state().dirs.insert(path.to_string(), mode);
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        timeout_secs: u64,
        sink: &dyn OutputSink,
    ) -> Result<ExitResult, SshError> {
        self.ensure_open()?;
        let script = {
            let mut state = self.state();
            state.commands.push(command.to_string());
            state.scripts.get(command).cloned()
        };
        let script = script.unwrap_or_else(|| {
            Script::new()
                .stderr(&format!("sh: {}: command not found\n", command))
                .exit(127)
        });

        let run = async {
            let mut output_bytes = 0u64;
            for step in &script.steps {
                match step {
                    Step::Out(stream, data) => {
                        output_bytes += data.len() as u64;
                        sink.emit(*stream, data);
                    }
                    Step::Sleep(d) => tokio::time::sleep(*d).await,
                }
            }
            output_bytes
        };

        match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
            Ok(output_bytes) => {
                if script.drop_connection {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(SshError::ConnectionLost(
                        "channel closed before exit status".to_string(),
                    ));
                }
                Ok(ExitResult {
                    exit_code: script.exit,
                    signal: None,
                    output_bytes,
                })
            }
            Err(_) => {
                // 与真实会话一致：超时后会话被关闭
                self.closed.store(true, Ordering::SeqCst);
                Err(SshError::Timeout(timeout_secs))
            }
        }
    }

    async fn close(&self) -> Result<(), SshError> {
        let fault = self.take_fault(|f| matches!(f, Fault::Close));
        self.closed.store(true, Ordering::SeqCst);
        self.state().closes += 1;
        match fault {
            Some(_) => Err(SshError::ConnectionLost("close failed".to_string())),
            None => Ok(()),
        }
    }
}

// ============================================================================
// 连接器
// ============================================================================

/// 每次连接返回同一内存主机上的新会话
#[derive(Default)]
pub struct FakeConnector {
    pub session: MemorySession,
    connect_error: Mutex<Option<SshError>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(session: MemorySession) -> Self {
        Self {
            session,
            ..Default::default()
        }
    }

    /// 下一次连接失败
    pub fn fail_connect(&self, error: SshError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        _host: &Host,
        _auth: AuthMethod,
    ) -> Result<Box<dyn RemoteSession>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.connect_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(Box::new(self.session.fork()))
    }
}

// ============================================================================
// 输出接收器
// ============================================================================

/// 记录所有输出块
#[derive(Default)]
pub struct RecordingSink {
    chunks: Mutex<Vec<(OutputStream, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn chunks(&self) -> Vec<(OutputStream, Vec<u8>)> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn stdout(&self) -> String {
        let chunks = self.chunks.lock().unwrap();
        let bytes: Vec<u8> = chunks
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .flat_map(|(_, d)| d.iter().copied())
            .collect();
        String::from_utf8(bytes).unwrap()
    }
}

impl OutputSink for RecordingSink {
    fn emit(&self, stream: OutputStream, data: &[u8]) {
        self.chunks.lock().unwrap().push((stream, data.to_vec()));
    }
}
