// 远程命令输出事件定义

use serde::{Deserialize, Serialize};

/// 输出流类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// 命令结束结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitResult {
    /// 退出码（被信号终止时为 None）
    pub exit_code: Option<u32>,
    /// 终止信号名（如果有）
    pub signal: Option<String>,
    /// 本次执行累计输出字节数
    pub output_bytes: u64,
}

impl ExitResult {
    /// 检查命令是否成功
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 输出接收器
/// 命令执行过程中每收到一个数据块就调用一次，调用顺序即产生顺序
pub trait OutputSink: Send + Sync {
    fn emit(&self, stream: OutputStream, data: &[u8]);
}
