//! Tool execution with argument parsing, approval gating, and truncation.

use crate::provider::{ToolCall, ToolResult};
use crate::tool::registry::ToolRegistry;
use crate::tool::types::{ApprovalHandler, ApprovalMode, ToolContext, ToolError};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Default ceiling on tool output, in characters.
pub const MAX_TOOL_OUTPUT: usize = 50_000;
pub const TRUNCATION_MARKER: &str = "… (output truncated)";

/// How a dispatch ended, for callers that route lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and produced output (possibly error-flagged).
    Completed,
    /// The handler raised.
    HandlerFailed,
    /// The approval callback said no (or no callback was registered).
    Denied,
    /// Short-circuited before the handler: malformed args or unknown tool.
    NotInvoked,
}

/// Executes tool calls against the registry under the active approval policy.
///
/// Per-call failures (malformed arguments, unknown tool, denial, handler
/// errors) never escape as `Err`; each becomes an error-flagged
/// [`ToolResult`] so the loop can hand it back to the model.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    approval_mode: RwLock<ApprovalMode>,
    approval_handler: RwLock<Option<Arc<dyn ApprovalHandler>>>,
    max_output: usize,
}

impl ToolExecutor {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            approval_mode: RwLock::new(ApprovalMode::default()),
            approval_handler: RwLock::new(None),
            max_output: MAX_TOOL_OUTPUT,
        }
    }

    #[must_use]
    pub fn with_max_output(mut self, ceiling: usize) -> Self {
        self.max_output = ceiling;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Runtime mode toggle (the "YOLO" switch).
    pub fn set_approval_mode(&self, mode: ApprovalMode) {
        *self.approval_mode.write().expect("approval mode lock") = mode;
    }

    #[must_use]
    pub fn approval_mode(&self) -> ApprovalMode {
        *self.approval_mode.read().expect("approval mode lock")
    }

    pub fn set_approval_handler(&self, handler: Arc<dyn ApprovalHandler>) {
        *self.approval_handler.write().expect("approval handler lock") = Some(handler);
    }

    #[must_use]
    pub fn approval_handler(&self) -> Option<Arc<dyn ApprovalHandler>> {
        self.approval_handler
            .read()
            .expect("approval handler lock")
            .clone()
    }

    /// Execute one call. See the module docs for the failure contract.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        self.execute_traced(call, ctx).await.0
    }

    /// [`execute`](Self::execute) plus how the dispatch ended.
    pub async fn execute_traced(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> (ToolResult, DispatchOutcome) {
        let name = call.name();

        let args = match call.parsed_arguments() {
            Ok(args) => args,
            Err(e) => {
                return (
                    ToolResult::error(&call.id, format!("Invalid tool arguments: {e}")),
                    DispatchOutcome::NotInvoked,
                );
            }
        };

        let Some(tool) = self.registry.get(name) else {
            return (
                ToolResult::error(&call.id, format!("Unknown tool: {name}")),
                DispatchOutcome::NotInvoked,
            );
        };

        let needs_approval = match self.approval_mode() {
            ApprovalMode::Always => true,
            ApprovalMode::Never => false,
            ApprovalMode::UnsafeOnly => !tool.auto_safe(),
        };

        if needs_approval {
            let handler = self
                .approval_handler
                .read()
                .expect("approval handler lock")
                .clone();
            match handler {
                Some(handler) => {
                    if !handler.ask_approval(name, &args).await {
                        return (
                            ToolResult::error(&call.id, "Tool execution denied by user"),
                            DispatchOutcome::Denied,
                        );
                    }
                }
                None => {
                    return (
                        ToolResult::error(
                            &call.id,
                            "Approval required but no handler registered",
                        ),
                        DispatchOutcome::Denied,
                    );
                }
            }
        }

        debug!(tool = name, "dispatching tool");
        match tool.execute(args, ctx).await {
            Ok(output) => {
                let content = truncate_output(output.content, self.max_output);
                (
                    ToolResult {
                        tool_call_id: call.id.clone(),
                        content,
                        is_error: output.is_error,
                    },
                    DispatchOutcome::Completed,
                )
            }
            Err(e) => (
                ToolResult::error(&call.id, e.to_string()),
                DispatchOutcome::HandlerFailed,
            ),
        }
    }

    /// Execute calls sequentially, preserving order.
    pub async fn execute_batch(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute(call, ctx).await);
        }
        results
    }
}

/// Cap `content` at `ceiling` characters, appending exactly one marker.
fn truncate_output(content: String, ceiling: usize) -> String {
    if content.chars().count() <= ceiling {
        return content;
    }
    let mut truncated: String = content.chars().take(ceiling).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::types::{Tool, ToolOutput};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool {
        invocations: AtomicUsize,
        safe: bool,
    }

    impl EchoTool {
        fn new(safe: bool) -> Self {
            Self {
                invocations: AtomicUsize::new(0),
                safe,
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo back the input"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        fn auto_safe(&self) -> bool {
            self.safe
        }
        async fn execute(
            &self,
            args: serde_json::Value,
            _: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let text = args
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidArgs("text is required".to_string()))?;
            Ok(ToolOutput::text(text))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _: serde_json::Value,
            _: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Err(ToolError::ExecutionFailed("disk on fire".to_string()))
        }
    }

    struct FixedApproval(bool);

    #[async_trait]
    impl ApprovalHandler for FixedApproval {
        async fn ask_approval(&self, _: &str, _: &serde_json::Value) -> bool {
            self.0
        }
    }

    fn setup(safe: bool) -> (Arc<EchoTool>, ToolExecutor, ToolContext) {
        let registry = Arc::new(ToolRegistry::new());
        let tool = Arc::new(EchoTool::new(safe));
        registry.register(tool.clone());
        let executor = ToolExecutor::new(registry);
        let ctx = ToolContext::new(PathBuf::from("."), "test-session");
        (tool, executor, ctx)
    }

    #[tokio::test]
    async fn malformed_args_short_circuit_without_invoking() {
        let (tool, executor, ctx) = setup(true);
        let call = ToolCall::new("c1", "echo", "{not json");
        let result = executor.execute(&call, &ctx).await;
        assert!(result.is_error);
        assert!(result.content.starts_with("Invalid tool arguments"));
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_tool_reports_name() {
        let (_, executor, ctx) = setup(true);
        let call = ToolCall::new("c1", "nope", "{}");
        let result = executor.execute(&call, &ctx).await;
        assert!(result.is_error);
        assert_eq!(result.content, "Unknown tool: nope");
    }

    #[tokio::test]
    async fn auto_safe_skips_prompt_under_unsafe_only() {
        let (tool, executor, ctx) = setup(true);
        let call = ToolCall::new("c1", "echo", r#"{"text":"hi"}"#);
        let result = executor.execute(&call, &ctx).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denial_yields_denied_result() {
        let (tool, executor, ctx) = setup(false);
        executor.set_approval_handler(Arc::new(FixedApproval(false)));
        let call = ToolCall::new("c1", "echo", r#"{"text":"hi"}"#);
        let result = executor.execute(&call, &ctx).await;
        assert!(result.is_error);
        assert_eq!(result.content, "Tool execution denied by user");
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn always_mode_asks_even_for_safe_tools() {
        let (tool, executor, ctx) = setup(true);
        executor.set_approval_mode(ApprovalMode::Always);
        executor.set_approval_handler(Arc::new(FixedApproval(true)));
        let call = ToolCall::new("c1", "echo", r#"{"text":"hi"}"#);
        let result = executor.execute(&call, &ctx).await;
        assert!(!result.is_error);
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_mode_skips_prompt_for_unsafe_tools() {
        let (tool, executor, ctx) = setup(false);
        executor.set_approval_mode(ApprovalMode::Never);
        let call = ToolCall::new("c1", "echo", r#"{"text":"hi"}"#);
        let result = executor.execute(&call, &ctx).await;
        assert!(!result.is_error);
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_handler_counts_as_denial() {
        let (_, executor, ctx) = setup(false);
        let call = ToolCall::new("c1", "echo", r#"{"text":"hi"}"#);
        let result = executor.execute(&call, &ctx).await;
        assert!(result.is_error);
        assert_eq!(result.content, "Approval required but no handler registered");
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_result() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FailTool));
        let executor = ToolExecutor::new(registry);
        executor.set_approval_mode(ApprovalMode::Never);
        let ctx = ToolContext::new(PathBuf::from("."), "s");
        let result = executor.execute(&ToolCall::new("c1", "fail", "{}"), &ctx).await;
        assert!(result.is_error);
        assert!(result.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn long_output_gets_exactly_one_marker() {
        let (_, executor, ctx) = setup(true);
        let executor = ToolExecutor {
            max_output: 10,
            ..executor
        };
        let call = ToolCall::new("c1", "echo", r#"{"text":"aaaaaaaaaaaaaaaaaaaa"}"#);
        let result = executor.execute(&call, &ctx).await;
        assert_eq!(result.content, format!("aaaaaaaaaa{TRUNCATION_MARKER}"));
        assert_eq!(result.content.matches(TRUNCATION_MARKER).count(), 1);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let (_, executor, ctx) = setup(true);
        let calls = vec![
            ToolCall::new("c1", "echo", r#"{"text":"first"}"#),
            ToolCall::new("c2", "nope", "{}"),
            ToolCall::new("c3", "echo", r#"{"text":"third"}"#),
        ];
        let results = executor.execute_batch(&calls, &ctx).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "first");
        assert_eq!(results[0].tool_call_id, "c1");
        assert!(results[1].is_error);
        assert_eq!(results[2].content, "third");
    }
}
