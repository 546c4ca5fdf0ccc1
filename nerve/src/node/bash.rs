//! BashNode: one shell invocation per `execute`, with a timeout (spec.md §4.2).

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use crate::context::ExecutionContext;
use crate::error::ErrorType;
use crate::node::{check_preconditions, ExecError, Node};
use crate::result::NodeResult;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BashNode {
    id: String,
    cwd: Option<PathBuf>,
    timeout: Duration,
    env: Vec<(String, String)>,
}

impl BashNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Node for BashNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &str {
        "bash"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        check_preconditions(ctx)?;
        let input = ctx.input.clone();
        let script = input.as_str().unwrap_or_default().to_string();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&script);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let timeout = ctx.timeout.unwrap_or(self.timeout);
        let result = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code().unwrap_or(-1);
                let attrs = json!({"stdout": stdout, "stderr": stderr, "exit_code": exit_code});
                if output.status.success() {
                    NodeResult::ok(self.node_type(), &self.id, input, serde_json::Value::String(stdout))
                        .with_attributes(attrs)
                } else {
                    NodeResult::err(
                        self.node_type(),
                        &self.id,
                        input,
                        format!("command exited with status {exit_code}"),
                        ErrorType::ExecutionError,
                    )
                    .with_attributes(attrs)
                }
            }
            Ok(Err(e)) => NodeResult::err(self.node_type(), &self.id, input, e.to_string(), ErrorType::InternalError),
            Err(_) => NodeResult::err(
                self.node_type(),
                &self.id,
                input,
                format!("timed out after {}ms", timeout.as_millis()),
                ErrorType::Timeout,
            ),
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn runs_shell_command_successfully() {
        let node = BashNode::new("sh");
        let ctx = ExecutionContext::new(None, Value::String("echo hi".to_string()));
        let result = node.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert!(result.output.as_str().unwrap().contains("hi"));
        assert_eq!(result.attributes["exit_code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_execution_error() {
        let node = BashNode::new("sh");
        let ctx = ExecutionContext::new(None, Value::String("exit 3".to_string()));
        let result = node.execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ErrorType::ExecutionError));
        assert_eq!(result.attributes["exit_code"], 3);
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let node = BashNode::new("sh").with_timeout(Duration::from_millis(50));
        let ctx = ExecutionContext::new(None, Value::String("sleep 5".to_string()));
        let result = node.execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ErrorType::Timeout));
    }
}
