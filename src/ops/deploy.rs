// 公钥部署
//
// 把请求的公钥并入 authorized_keys：只增不删，已存在的行不重复写入。
// 每个非空行视为一个条目，按整行字节比较；原有行按原字节写回。

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Operation, OperationContext, OperationError};
use crate::models::{TaskKind, TaskOutcome, TaskParams};
use crate::ssh::transport::parent_dir;
use crate::ssh::{atomic_write_file, OutputStream, SshError};

/// .ssh 目录权限
const SSH_DIR_MODE: u32 = 0o700;
/// authorized_keys 文件权限
const AUTHORIZED_KEYS_MODE: u32 = 0o600;

/// 合并结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMerge {
    /// 合并后的条目（原有条目在前，保持原顺序和原字节）
    pub lines: Vec<Vec<u8>>,
    /// 新增条目数
    pub added: usize,
}

impl KeyMerge {
    pub fn render(&self) -> Vec<u8> {
        let mut content = self.lines.join(&b'\n');
        content.push(b'\n');
        content
    }
}

/// 去掉首尾 ASCII 空白
fn trim_bytes(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if !first.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    while let [rest @ .., last] = line {
        if !last.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    line
}

/// 计算现有内容与请求公钥的并集
/// 现有内容不要求是合法 UTF-8
pub fn merge_authorized_keys(existing: &[u8], requested: &[String]) -> KeyMerge {
    let mut lines: Vec<Vec<u8>> = existing
        .split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .filter(|l| !trim_bytes(l).is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    let mut seen: HashSet<Vec<u8>> = lines.iter().map(|l| trim_bytes(l).to_vec()).collect();

    let mut added = 0;
    for key in requested.iter().flat_map(|k| k.lines()) {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if seen.insert(key.as_bytes().to_vec()) {
            lines.push(key.as_bytes().to_vec());
            added += 1;
        }
    }

    KeyMerge { lines, added }
}

/// 部署公钥
pub struct DeployKeys;

#[async_trait]
impl Operation for DeployKeys {
    fn kind(&self) -> TaskKind {
        TaskKind::DeployKeys
    }

    async fn run(
        &self,
        ctx: &OperationContext<'_>,
        params: &TaskParams,
    ) -> Result<TaskOutcome, OperationError> {
        let TaskParams::DeployKeys { keys } = params else {
            return Err(OperationError::InvalidParams {
                kind: TaskKind::DeployKeys.as_str(),
                message: format!("got {} parameters", params.kind().as_str()),
            });
        };

        let path = ctx.deploy.authorized_keys_path.as_str();
        let existing = match ctx.session.read_file(path).await {
            Ok(content) => content,
            Err(SshError::NotFound(_)) => {
                debug!("[Deploy] {} does not exist yet", path);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let merge = merge_authorized_keys(&existing, keys);
        let total = merge.lines.len();

        if merge.added == 0 {
            info!("[Deploy] {} already contains all {} keys", path, keys.len());
            ctx.sink.emit(
                OutputStream::Stdout,
                format!("{} already up to date ({} keys)\n", path, total).as_bytes(),
            );
            return Ok(TaskOutcome::Deploy { added: 0, total });
        }

        if let Some(dir) = parent_dir(path) {
            ctx.session.create_dir_all(dir, SSH_DIR_MODE).await?;
        }
        atomic_write_file(
            ctx.session,
            path,
            &merge.render(),
            AUTHORIZED_KEYS_MODE,
        )
        .await?;

        info!("[Deploy] Added {} keys to {} ({} total)", merge.added, path, total);
        ctx.sink.emit(
            OutputStream::Stdout,
            format!("added {} keys to {} ({} total)\n", merge.added, path, total).as_bytes(),
        );

        Ok(TaskOutcome::Deploy {
            added: merge.added,
            total,
        })
    }
}
