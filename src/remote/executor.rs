use super::{connect, CommandOutput, ConnectionTarget, SessionProfile, Transport};
use crate::error::{BackupError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Runs one shell command per session: connect, exec, disconnect.
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    profile: SessionProfile,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            profile: SessionProfile::standard(connect_timeout),
        }
    }

    /// Fails with `RemoteCommand` on a non-zero exit.
    pub async fn run(&self, target: &ConnectionTarget, command: &str) -> Result<CommandOutput> {
        let output = self.run_unchecked(target, command).await?;
        if !output.is_success() {
            return Err(BackupError::RemoteCommand {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Returns the output whatever the exit code. Transport failures still error.
    pub async fn run_unchecked(
        &self,
        target: &ConnectionTarget,
        command: &str,
    ) -> Result<CommandOutput> {
        debug!("[{}] $ {}", target.host, command);

        let mut session = connect(&self.transport, target, &self.profile).await?;
        let command = command.to_string();
        let output = tokio::task::spawn_blocking(move || session.exec(&command)).await??;

        debug!("[{}] exit code {}", target.host, output.exit_code);
        Ok(output)
    }

    /// Opens a session and runs a trivial command to prove the credentials work.
    pub async fn verify_connection(&self, target: &ConnectionTarget) -> Result<()> {
        let output = self.run(target, "echo ok").await?;
        if output.stdout.trim() != "ok" {
            return Err(BackupError::Connection(format!(
                "unexpected response from {}: {:?}",
                target.host,
                output.stdout.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{target, FakeTransport};

    #[tokio::test]
    async fn test_run_captures_output() {
        let fake = FakeTransport::new();
        let executor = RemoteExecutor::new(fake.clone().into_transport(), Duration::from_secs(1));

        let output = executor.run(&target("web"), "echo ok").await.unwrap();
        assert_eq!(output.stdout.trim(), "ok");
        assert!(output.is_success());
        assert_eq!(fake.commands(), vec!["echo ok".to_string()]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_remote_command_error() {
        let fake = FakeTransport::new();
        fake.fail_commands_containing("false");
        let executor = RemoteExecutor::new(fake.into_transport(), Duration::from_secs(1));

        let err = executor.run(&target("web"), "false").await.unwrap_err();
        match err {
            BackupError::RemoteCommand { exit_code, stderr } => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("simulated"));
            }
            other => panic!("expected RemoteCommand, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_unchecked_tolerates_failure() {
        let fake = FakeTransport::new();
        fake.fail_commands_containing("false");
        let executor = RemoteExecutor::new(fake.into_transport(), Duration::from_secs(1));

        let output = executor.run_unchecked(&target("web"), "false").await.unwrap();
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let fake = FakeTransport::new();
        fake.mark_unreachable("down");
        let executor = RemoteExecutor::new(fake.clone().into_transport(), Duration::from_secs(1));

        let err = executor.verify_connection(&target("down")).await.unwrap_err();
        assert!(err.is_connection());
        assert!(fake.commands().is_empty());
    }

    #[tokio::test]
    async fn test_each_call_opens_its_own_session() {
        let fake = FakeTransport::new();
        let executor = RemoteExecutor::new(fake.clone().into_transport(), Duration::from_secs(1));

        executor.run(&target("web"), "echo ok").await.unwrap();
        executor.run(&target("web"), "echo ok").await.unwrap();
        assert_eq!(fake.connect_count(), 2);
    }
}
