use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Execution context handed to every tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub session_id: String,
    pub abort_signal: CancellationToken,
}

impl ToolContext {
    #[must_use]
    pub fn new(working_dir: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            working_dir,
            session_id: session_id.into(),
            abort_signal: CancellationToken::new(),
        }
    }
}

/// Raw output of a tool handler, before the executor's truncation pass.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub metadata: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }
}

/// A registered capability: schema plus invocation handler.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema for the argument object.
    fn parameters(&self) -> serde_json::Value;

    /// Side-effect-free tools opt out of the approval prompt under the
    /// `unsafe-only` mode.
    fn auto_safe(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Runtime policy controlling when the user is prompted before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Every tool call asks.
    Always,
    /// No prompts (the "YOLO" switch).
    Never,
    /// Ask only for tools that are not auto-safe.
    #[default]
    UnsafeOnly,
}

/// Interface for approval prompts, usually implemented by the renderer.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn ask_approval(&self, tool_name: &str, args: &serde_json::Value) -> bool;
}
