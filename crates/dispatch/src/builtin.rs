//! Built-in executors.

use super::r#trait::*;
use async_trait::async_trait;
use tokio::process::Command;

/// Runs commands through a local shell.
///
/// The command line comes from the `command` parameter; an optional `env`
/// object parameter adds environment variables.
pub struct ShellExecutor {
    name: String,
    shell: String,
    operations: Vec<String>,
}

impl ShellExecutor {
    /// Create a shell executor serving `operations` with `sh -c`.
    pub fn new(name: impl Into<String>, operations: Vec<String>) -> Self {
        Self {
            name: name.into(),
            shell: "sh".to_string(),
            operations,
        }
    }

    /// Use another shell binary (invoked as `<shell> -c <command>`).
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> Vec<String> {
        self.operations.clone()
    }

    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput, anyhow::Error> {
        let start = std::time::Instant::now();

        let command_line = request
            .str_param("command")
            .ok_or_else(|| anyhow::anyhow!("operation '{}' requires a 'command' parameter", request.operation))?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command_line).kill_on_drop(true);

        if let Some(env) = request.params.get("env").and_then(|v| v.as_object()) {
            for (k, v) in env {
                match v.as_str() {
                    Some(s) => cmd.env(k, s),
                    None => cmd.env(k, v.to_string()),
                };
            }
        }

        let output = match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| anyhow::anyhow!("'{}' timed out after {:?}", command_line, timeout))??,
            None => cmd.output().await?,
        };

        let mut result = CommandOutput::from_text(
            output.status.code().unwrap_or(-1),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        );
        result.executor = self.name.clone();
        result.duration = start.elapsed();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell() -> ShellExecutor {
        ShellExecutor::new("local", vec!["exec".to_string()])
    }

    #[tokio::test]
    async fn test_runs_command() {
        let request = CommandRequest::new("exec").param("command", "echo hello; echo oops 1>&2; exit 3");
        let output = shell().execute(&request).await.unwrap();
        assert_eq!(output.return_code, 3);
        assert_eq!(output.stdout_lines, vec!["hello"]);
        assert_eq!(output.stderr_lines, vec!["oops"]);
        assert_eq!(output.executor, "local");
    }

    #[tokio::test]
    async fn test_env_parameter() {
        let request = CommandRequest::new("exec")
            .param("command", "echo $GREETING")
            .param("env", serde_json::json!({"GREETING": "hi"}));
        let output = shell().execute(&request).await.unwrap();
        assert_eq!(output.stdout_lines, vec!["hi"]);
    }

    #[tokio::test]
    async fn test_missing_command_is_transport_error() {
        let request = CommandRequest::new("exec");
        assert!(shell().execute(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let request = CommandRequest::new("exec")
            .param("command", "sleep 5")
            .timeout(Duration::from_millis(50));
        let err = shell().execute(&request).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
