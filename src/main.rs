// Ocultum - SSH 密钥部署与远程命令执行
// 命令行入口

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ocultum::live::LiveOutputChannel;
use ocultum::models::{AppSettings, NewCredential, NewHost};
use ocultum::runner::{FsArtifactStore, TaskRunner, WorkerPool};
use ocultum::services::storage;
use ocultum::ssh::{HostTrust, SshConnector};
use ocultum::store::Database;
use ocultum::tasks::TaskService;
use ocultum::vault::{CredentialVault, VAULT_KEY_ENV};

/// 主机密码默认读取的环境变量
const PASSWORD_ENV: &str = "OCULTUM_PASSWORD";

#[derive(Parser)]
#[command(name = "ocultum", version, about = "SSH key deployment and remote command runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write default settings and print a new credential key
    Init,
    /// Run task workers until interrupted
    Worker {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Manage hosts
    #[command(subcommand)]
    Host(HostCommand),
    /// Manage the public key catalogue
    #[command(subcommand)]
    Key(KeyCommand),
    /// Enqueue a key deployment (all catalogue keys when none are given)
    Deploy {
        host: String,
        /// Catalogue key id or name
        #[arg(long = "key")]
        keys: Vec<String>,
        /// Literal OpenSSH public key
        #[arg(long = "public-key")]
        public_keys: Vec<String>,
    },
    /// Enqueue a remote command
    Run {
        host: String,
        command: String,
        #[arg(long)]
        timeout: Option<u64>,
        /// Stream output until the task finishes
        #[arg(long)]
        follow: bool,
    },
    /// Print a task record as JSON
    Show { task: String },
    /// Stream task output as JSON lines
    Watch { task: String },
    /// List recent tasks
    Tasks {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Fail running tasks whose heartbeat is too old
    Sweep {
        #[arg(long)]
        older_than: Option<u64>,
    },
}

#[derive(Subcommand)]
enum HostCommand {
    Add(HostAddArgs),
    List,
    Rm { host: String },
}

#[derive(Args)]
struct HostAddArgs {
    name: String,
    hostname: String,
    #[arg(long, default_value_t = 22)]
    port: u16,
    #[arg(long)]
    user: String,
    /// Private key file; password auth is used when absent
    #[arg(long)]
    identity: Option<PathBuf>,
    /// Environment variable holding the password or key passphrase
    #[arg(long, default_value = PASSWORD_ENV)]
    secret_env: String,
}

#[derive(Subcommand)]
enum KeyCommand {
    Add { name: String, public_key: String },
    List,
    Rm { key: String },
}

/// 进程内共享组件
struct App {
    settings: AppSettings,
    db: Arc<Database>,
    live: Arc<LiveOutputChannel>,
}

impl App {
    fn open() -> Result<Self> {
        let settings = storage::load_settings()?;
        let db_path = storage::database_path(&settings)?;
        let db = Arc::new(
            Database::open(&db_path)
                .with_context(|| format!("无法打开数据库 {}", db_path.display()))?,
        );
        let live = Arc::new(LiveOutputChannel::new(db.clone(), settings.stream.clone()));
        Ok(Self { settings, db, live })
    }

    fn service(&self) -> TaskService {
        TaskService::new(self.db.clone(), self.live.clone(), self.settings.runner.clone())
    }

    fn vault(&self) -> Result<Arc<CredentialVault>> {
        let vault = CredentialVault::from_env()
            .with_context(|| format!("请设置 {}（可用 `ocultum init` 生成）", VAULT_KEY_ENV))?;
        Ok(Arc::new(vault))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug ocultum worker
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Init => init(),
        command => run(App::open()?, command).await,
    }
}

async fn run(app: App, command: Command) -> Result<()> {
    match command {
        Command::Init => init(),
        Command::Worker { workers } => run_workers(&app, workers).await,
        Command::Host(cmd) => host_command(&app, cmd),
        Command::Key(cmd) => key_command(&app, cmd),
        Command::Deploy {
            host,
            keys,
            public_keys,
        } => {
            let service = app.service();
            let id = if keys.is_empty() && public_keys.is_empty() {
                service.enqueue_deploy_entries(&host, None)?
            } else {
                let mut all = service.resolve_public_keys(&keys)?;
                all.extend(public_keys);
                service.enqueue_deploy(&host, &all)?
            };
            println!("{}", id);
            Ok(())
        }
        Command::Run {
            host,
            command,
            timeout,
            follow,
        } => {
            let id = app.service().enqueue_command(&host, &command, timeout)?;
            println!("{}", id);
            if follow {
                watch(&app, &id).await?;
            }
            Ok(())
        }
        Command::Show { task } => {
            let record = app.service().query_task(&task)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Watch { task } => watch(&app, &task).await,
        Command::Tasks { limit } => {
            for task in app.service().recent_tasks(limit)? {
                println!(
                    "{}  {:<11} {:<9} {}",
                    task.id,
                    task.kind.as_str(),
                    task.status.as_str(),
                    task.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Command::Sweep { older_than } => {
            let secs = older_than
                .or(app.settings.runner.stale_after_secs)
                .context("请指定 --older-than 或设置 runner.stale_after_secs")?;
            let runner = build_runner(&app, app.vault()?)?;
            let swept = runner.sweep_stale(Duration::from_secs(secs)).await?;
            for id in &swept {
                println!("{}", id);
            }
            info!("Swept {} stale tasks", swept.len());
            Ok(())
        }
    }
}

/// 写入默认设置并生成凭据密钥
fn init() -> Result<()> {
    let path = storage::get_settings_file()?;
    if path.exists() {
        warn!("Settings already exist at {}", path.display());
    } else {
        storage::save_settings(&AppSettings::default())?;
        info!("Wrote default settings to {}", path.display());
    }
    println!("export {}={}", VAULT_KEY_ENV, CredentialVault::generate_key());
    Ok(())
}

fn build_runner(app: &App, vault: Arc<CredentialVault>) -> Result<TaskRunner> {
    let trust = Arc::new(HostTrust::new(app.db.clone()));
    let connector = Arc::new(SshConnector::new(app.settings.connection.clone(), trust));
    let artifacts = Arc::new(FsArtifactStore::new(storage::artifacts_dir(&app.settings)?));
    Ok(TaskRunner::new(
        app.db.clone(),
        vault,
        connector,
        app.live.clone(),
        artifacts,
        app.settings.runner.clone(),
        app.settings.output.clone(),
        app.settings.deploy.clone(),
    ))
}

async fn run_workers(app: &App, workers: Option<usize>) -> Result<()> {
    let runner = Arc::new(build_runner(app, app.vault()?)?);
    let pool = WorkerPool::new(runner);
    let shutdown = CancellationToken::new();

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, finishing running tasks");
            on_signal.cancel();
        }
    });

    pool.run(workers.unwrap_or(app.settings.runner.workers), shutdown)
        .await;
    Ok(())
}

fn host_command(app: &App, cmd: HostCommand) -> Result<()> {
    let service = app.service();
    match cmd {
        HostCommand::Add(args) => {
            let secret = std::env::var(&args.secret_env).ok().filter(|s| !s.is_empty());
            let credential = match args.identity {
                Some(path) => {
                    let key = std::fs::read_to_string(&path)
                        .with_context(|| format!("无法读取私钥 {}", path.display()))?;
                    NewCredential::PrivateKey {
                        key: SecretString::from(key),
                        passphrase: secret.map(SecretString::from),
                    }
                }
                None => match secret {
                    Some(password) => NewCredential::Password(SecretString::from(password)),
                    None => bail!("密码认证需要设置环境变量 {}", args.secret_env),
                },
            };
            let host = service
                .with_vault(app.vault()?)
                .register_host(NewHost {
                    name: args.name,
                    hostname: args.hostname,
                    port: args.port,
                    username: args.user,
                    credential,
                })?;
            println!("{}", host.id);
        }
        HostCommand::List => {
            for host in service.list_hosts()? {
                println!(
                    "{}  {:<16} {}@{}:{}  {}  {}",
                    host.id,
                    host.name,
                    host.username,
                    host.hostname,
                    host.port,
                    host.auth_type.as_str(),
                    host.fingerprint.as_deref().unwrap_or("-")
                );
            }
        }
        HostCommand::Rm { host } => service.delete_host(&host)?,
    }
    Ok(())
}

fn key_command(app: &App, cmd: KeyCommand) -> Result<()> {
    let service = app.service();
    match cmd {
        KeyCommand::Add { name, public_key } => {
            let entry = service.add_public_key(&name, &public_key)?;
            println!("{}", entry.id);
        }
        KeyCommand::List => {
            for entry in service.list_public_keys()? {
                println!("{}  {:<16} {}", entry.id, entry.name, entry.public_key);
            }
        }
        KeyCommand::Rm { key } => service.delete_public_key(&key)?,
    }
    Ok(())
}

/// 以 JSON 行输出订阅消息，直到任务结束
async fn watch(app: &App, task_id: &str) -> Result<()> {
    let mut events = Box::pin(app.service().stream_task(task_id)?);
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event?)?);
    }
    Ok(())
}
