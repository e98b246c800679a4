// 数据模型模块

pub mod host;
pub mod settings;
pub mod task;

pub use host::{AuthType, Host, NewCredential, NewHost, PublicKeyEntry};
pub use settings::AppSettings;
pub use task::{
    FailureKind, TaskFailure, TaskKind, TaskOutcome, TaskParams, TaskRecord, TaskStatus,
};
