// Settings 配置数据结构

use serde::{Deserialize, Serialize};

// ======================== 主配置结构 ========================

/// 应用设置（持久化用）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub connection: ConnectionSettings,
    pub runner: RunnerSettings,
    pub output: OutputSettings,
    pub stream: StreamSettings,
    pub deploy: DeploySettings,
    pub database: DatabaseSettings,
}

// ======================== 连接设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    /// TCP 连接 + 握手 + 认证的总超时
    pub connect_timeout_secs: u64,
    /// 0 表示关闭心跳
    pub keepalive_interval_secs: u64,
    pub keepalive_max: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
        }
    }
}

// ======================== 任务执行设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerSettings {
    pub workers: usize,
    /// 轮询待执行任务的间隔
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub default_command_timeout_secs: u64,
    pub max_command_timeout_secs: u64,
    /// 超过该时长无心跳的 running 任务标记为失败；None 表示不清扫
    pub stale_after_secs: Option<u64>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 500,
            heartbeat_interval_secs: 15,
            default_command_timeout_secs: 60,
            max_command_timeout_secs: 3600,
            stale_after_secs: None,
        }
    }
}

// ======================== 输出设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    /// 任务记录中内联保存的输出上限（字节）
    /// 按 stdout 与 stderr 的合计长度判断；超出时每个流只内联前 limit/2 字节，
    /// 完整输出另存到 artifacts 目录
    pub inline_limit_bytes: usize,
    /// 大输出存放目录，默认 <配置目录>/artifacts
    pub artifacts_dir: Option<String>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            inline_limit_bytes: 10_000,
            artifacts_dir: None,
        }
    }
}

// ======================== 实时输出设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    pub poll_interval_ms: u64,
    /// 任务结束后保留订阅资源的时间
    pub grace_period_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            grace_period_secs: 30,
        }
    }
}

// ======================== 部署设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploySettings {
    /// 相对路径以登录目录为基准
    pub authorized_keys_path: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            authorized_keys_path: ".ssh/authorized_keys".to_string(),
        }
    }
}

// ======================== 数据库设置 ========================

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    /// 默认 <配置目录>/ocultum.db
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{ "runner": { "workers": 8 }, "stream": {} }"#).unwrap();
        assert_eq!(settings.runner.workers, 8);
        assert_eq!(settings.runner.poll_interval_ms, 500);
        assert_eq!(settings.runner.stale_after_secs, None);
        assert_eq!(settings.output.inline_limit_bytes, 10_000);
        assert_eq!(settings.stream.grace_period_secs, 30);
        assert_eq!(settings.deploy.authorized_keys_path, ".ssh/authorized_keys");
        assert_eq!(settings.connection, ConnectionSettings::default());
    }
}
