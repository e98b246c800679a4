// 集成测试公共设施：内存远程主机与测试环境

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use ocultum::live::LiveOutputChannel;
use ocultum::models::settings::{DeploySettings, OutputSettings, RunnerSettings, StreamSettings};
use ocultum::models::{Host, NewCredential, NewHost};
use ocultum::runner::{FsArtifactStore, TaskRunner};
use ocultum::ssh::{
    AuthMethod, ExitResult, OutputSink, OutputStream, RemoteSession, SessionConnector, SshError,
};
use ocultum::store::Database;
use ocultum::tasks::TaskService;
use ocultum::vault::CredentialVault;

/// 一条命令的输出：(流, 数据, 输出前等待的毫秒数)
#[derive(Clone, Default)]
pub struct Program {
    pub output: Vec<(OutputStream, String, u64)>,
    pub exit_code: u32,
}

impl Program {
    pub fn exit(code: u32) -> Self {
        Self {
            output: Vec::new(),
            exit_code: code,
        }
    }

    pub fn out(mut self, data: &str) -> Self {
        self.output.push((OutputStream::Stdout, data.to_string(), 0));
        self
    }

    pub fn err(mut self, data: &str) -> Self {
        self.output.push((OutputStream::Stderr, data.to_string(), 0));
        self
    }

    pub fn out_after(mut self, delay_ms: u64, data: &str) -> Self {
        self.output
            .push((OutputStream::Stdout, data.to_string(), delay_ms));
        self
    }
}

#[derive(Default)]
struct HostState {
    files: HashMap<String, Vec<u8>>,
    programs: HashMap<String, Program>,
}

/// 内存远程主机，所有连接共享文件系统
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn program(&self, command: &str, program: Program) {
        self.state
            .lock()
            .unwrap()
            .programs
            .insert(command.to_string(), program);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|d| String::from_utf8(d.clone()).unwrap())
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.as_bytes().to_vec());
    }
}

struct FakeSession {
    host: FakeHost,
    closed: AtomicBool,
}

impl FakeSession {
    fn check(&self) -> Result<(), SshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionLost("closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SshError> {
        self.check()?;
        let state = self.host.state.lock().unwrap();
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SshError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &[u8], _mode: u32) -> Result<(), SshError> {
        self.check()?;
        let mut state = self.host.state.lock().unwrap();
        state.files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        self.check()?;
        let mut state = self.host.state.lock().unwrap();
        let data = state
            .files
            .remove(from)
            .ok_or_else(|| SshError::NotFound(from.to_string()))?;
        state.files.insert(to.to_string(), data);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        self.check()?;
        self.host.state.lock().unwrap().files.remove(path);
        Ok(())
    }

    async fn create_dir_all(&self, _path: &str, _mode: u32) -> Result<(), SshError> {
        self.check()
    }

    async fn run_command(
        &self,
        command: &str,
        timeout_secs: u64,
        sink: &dyn OutputSink,
    ) -> Result<ExitResult, SshError> {
        self.check()?;
        let program = self
            .host
            .state
            .lock()
            .unwrap()
            .programs
            .get(command)
            .cloned()
            .unwrap_or_else(|| Program::exit(127).err("command not found\n"));

        let run = async {
            let mut bytes = 0u64;
            for (stream, data, delay_ms) in &program.output {
                if *delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
                bytes += data.len() as u64;
                sink.emit(*stream, data.as_bytes());
            }
            bytes
        };
        match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
            Ok(output_bytes) => Ok(ExitResult {
                exit_code: Some(program.exit_code),
                signal: None,
                output_bytes,
            }),
            Err(_) => Err(SshError::Timeout(timeout_secs)),
        }
    }

    async fn close(&self) -> Result<(), SshError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// 每次连接打开 FakeHost 上的新会话
pub struct FakeConnector {
    pub host: FakeHost,
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        _host: &Host,
        _auth: AuthMethod,
    ) -> Result<Box<dyn RemoteSession>, SshError> {
        Ok(Box::new(FakeSession {
            host: self.host.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// 一套完整的测试环境（数据库文件位于临时目录）
pub struct Env {
    pub dir: tempfile::TempDir,
    pub db: Arc<Database>,
    pub live: Arc<LiveOutputChannel>,
    pub service: TaskService,
    pub runner: TaskRunner,
    pub remote: FakeHost,
}

pub fn stream_settings() -> StreamSettings {
    StreamSettings {
        poll_interval_ms: 20,
        grace_period_secs: 1,
    }
}

pub fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("ocultum.db")).unwrap());
    let vault = Arc::new(CredentialVault::new(&[42u8; 32]).unwrap());
    let live = Arc::new(LiveOutputChannel::new(db.clone(), stream_settings()));
    let remote = FakeHost::default();

    let service = TaskService::new(db.clone(), live.clone(), RunnerSettings::default())
        .with_vault(vault.clone());
    let runner = TaskRunner::new(
        db.clone(),
        vault,
        Arc::new(FakeConnector {
            host: remote.clone(),
        }),
        live.clone(),
        Arc::new(FsArtifactStore::new(dir.path().join("artifacts"))),
        RunnerSettings::default(),
        OutputSettings::default(),
        DeploySettings::default(),
    );

    Env {
        dir,
        db,
        live,
        service,
        runner,
        remote,
    }
}

/// 同一数据库文件上的另一个连接（模拟另一个进程）
pub fn reopen(path: &Path) -> Arc<Database> {
    Arc::new(Database::open(path).unwrap())
}

pub fn register(service: &TaskService, name: &str) -> Host {
    service
        .register_host(NewHost {
            name: name.to_string(),
            hostname: format!("{}.internal", name),
            port: 22,
            username: "deploy".to_string(),
            credential: NewCredential::Password(SecretString::from("pw".to_string())),
        })
        .unwrap()
}
