// 远程命令执行

use async_trait::async_trait;
use tracing::info;

use super::{Operation, OperationContext, OperationError};
use crate::models::{TaskKind, TaskOutcome, TaskParams};

/// 运行一条命令，输出逐块推送
pub struct RunCommand;

#[async_trait]
impl Operation for RunCommand {
    fn kind(&self) -> TaskKind {
        TaskKind::RunCommand
    }

    async fn run(
        &self,
        ctx: &OperationContext<'_>,
        params: &TaskParams,
    ) -> Result<TaskOutcome, OperationError> {
        let TaskParams::RunCommand {
            command,
            timeout_secs,
        } = params
        else {
            return Err(OperationError::InvalidParams {
                kind: TaskKind::RunCommand.as_str(),
                message: format!("got {} parameters", params.kind().as_str()),
            });
        };

        let result = ctx
            .session
            .run_command(command, *timeout_secs, ctx.sink)
            .await?;

        info!(
            "[Command] Finished with exit code {:?}, {} bytes of output",
            result.exit_code, result.output_bytes
        );

        Ok(TaskOutcome::Command {
            exit_code: result.exit_code,
            signal: result.signal,
            output_bytes: result.output_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::DeploySettings;
    use crate::ssh::{OutputStream, SshError};
    use crate::test_utils::{MemorySession, RecordingSink, Script};

    fn params(command: &str, timeout_secs: u64) -> TaskParams {
        TaskParams::RunCommand {
            command: command.to_string(),
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn test_streams_output_and_reports_exit() {
        let session = MemorySession::new();
        session.script(
            "echo hello; echo oops >&2",
            Script::new()
                .stdout("hello\n")
                .stderr("oops\n")
                .exit(0),
        );
        let sink = RecordingSink::default();
        let deploy = DeploySettings::default();
        let ctx = OperationContext {
            session: &session,
            sink: &sink,
            deploy: &deploy,
        };

        let outcome = RunCommand
            .run(&ctx, &params("echo hello; echo oops >&2", 5))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TaskOutcome::Command {
                exit_code: Some(0),
                signal: None,
                output_bytes: 11,
            }
        );
        assert_eq!(
            sink.chunks(),
            vec![
                (OutputStream::Stdout, b"hello\n".to_vec()),
                (OutputStream::Stderr, b"oops\n".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_outcome() {
        let session = MemorySession::new();
        session.script("false", Script::new().exit(1));
        let sink = RecordingSink::default();
        let deploy = DeploySettings::default();
        let ctx = OperationContext {
            session: &session,
            sink: &sink,
            deploy: &deploy,
        };

        let outcome = RunCommand.run(&ctx, &params("false", 5)).await.unwrap();
        assert_eq!(outcome.exit_code(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_earlier_output() {
        let session = MemorySession::new();
        session.script(
            "echo start; sleep 10",
            Script::new().stdout("start\n").sleep_secs(10).exit(0),
        );
        let sink = RecordingSink::default();
        let deploy = DeploySettings::default();
        let ctx = OperationContext {
            session: &session,
            sink: &sink,
            deploy: &deploy,
        };

        let started = tokio::time::Instant::now();
        let err = RunCommand
            .run(&ctx, &params("echo start; sleep 10", 2))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OperationError::Transport(SshError::Timeout(2))
        ));
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
        assert_eq!(sink.stdout(), "start\n");
    }

    #[tokio::test]
    async fn test_wrong_params_rejected() {
        let session = MemorySession::new();
        let sink = RecordingSink::default();
        let deploy = DeploySettings::default();
        let ctx = OperationContext {
            session: &session,
            sink: &sink,
            deploy: &deploy,
        };
        let err = RunCommand
            .run(&ctx, &TaskParams::DeployKeys { keys: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::InvalidParams { .. }));
    }
}
