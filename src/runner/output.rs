// 任务输出的内联上限与外部存储

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::ssh::OutputStream;
use crate::store::OutputChunk;

const TRUNCATED_MARKER: &str = "\n... (truncated)";

/// 大输出存储
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// 保存内容，返回可供查询的位置
    async fn put(&self, key: &str, data: &[u8]) -> std::io::Result<String>;
}

/// 本地目录实现
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, data: &[u8]) -> std::io::Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        debug!("[Runner] Stored {} bytes at {}", data.len(), path.display());
        Ok(path.to_string_lossy().into_owned())
    }
}

/// 任务输出的存储键
pub fn artifact_key(task_id: &str) -> String {
    format!("tasks/{}/output.txt", task_id)
}

/// 内联保存的输出
#[derive(Debug, PartialEq, Eq)]
pub struct BoundedOutput {
    pub stdout: String,
    pub stderr: String,
    /// 超出上限时的完整输出（按产生顺序拼接）
    pub overflow: Option<Vec<u8>>,
}

/// 按上限整理输出
/// 总量不超过 limit 时全部内联；否则每个流内联前 limit/2 字节并返回完整输出
pub fn bound_output(chunks: &[OutputChunk], limit: usize) -> BoundedOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for chunk in chunks {
        match chunk.stream {
            OutputStream::Stdout => stdout.extend_from_slice(&chunk.data),
            OutputStream::Stderr => stderr.extend_from_slice(&chunk.data),
        }
    }

    if stdout.len() + stderr.len() <= limit {
        return BoundedOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            overflow: None,
        };
    }

    let head = limit / 2;
    let combined: Vec<u8> = chunks
        .iter()
        .flat_map(|c| c.data.iter().copied())
        .collect();
    BoundedOutput {
        stdout: truncate_head(&stdout, head),
        stderr: truncate_head(&stderr, head),
        overflow: Some(combined),
    }
}

fn truncate_head(data: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(data);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATED_MARKER)
}
