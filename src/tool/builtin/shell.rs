use crate::tool::guard::analyze_command;
use crate::tool::types::{Tool, ToolContext, ToolError, ToolOutput};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

/// Shell command execution. The reference builtin for the registration
/// contract; dangerous patterns are rejected before spawn, regardless of the
/// active approval mode.
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace"
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let command_str = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("command is required".to_string()))?;

        let risk = analyze_command(command_str);
        if let Some(reason) = risk.reason() {
            return Err(ToolError::ExecutionFailed(format!(
                "Command rejected: {reason}"
            )));
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(command_str)
            .current_dir(&ctx.working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to spawn command: {e}")))?;

        let output = tokio::select! {
            res = child.wait_with_output() => res
                .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read output: {e}")))?,
            () = ctx.abort_signal.cancelled() => return Err(ToolError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let mut content = stdout;
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("STDERR:\n");
            content.push_str(&stderr);
        }

        Ok(ToolOutput {
            content,
            is_error: !output.status.success(),
            metadata: Some(json!({ "exit_code": output.status.code() })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> ToolContext {
        ToolContext::new(PathBuf::from("."), "test")
    }

    #[tokio::test]
    async fn runs_command_and_captures_stdout() {
        let out = ShellTool
            .execute(json!({"command": "echo hello"}), &ctx())
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_flags_error() {
        let out = ShellTool
            .execute(json!({"command": "exit 3"}), &ctx())
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(out.metadata.unwrap()["exit_code"], 3);
    }

    #[tokio::test]
    async fn dangerous_command_rejected_before_spawn() {
        let err = ShellTool
            .execute(json!({"command": "rm -rf /"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(msg) if msg.contains("rejected")));
    }

    #[tokio::test]
    async fn missing_command_is_invalid_args() {
        let err = ShellTool.execute(json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }
}
