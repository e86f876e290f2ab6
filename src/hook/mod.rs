//! Hook pipeline: synchronous interception points that can block, amend, or
//! observe core events.
//!
//! Handlers for an event run in registration order. Inline handlers run
//! in-process racing a per-descriptor timeout; command handlers run under the
//! platform shell with the serialized input in the `HOOK_INPUT` environment
//! variable. The first blocking output short-circuits the rest of the
//! pipeline for that event.

use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

/// Default timeout for a single hook handler.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Moments in the lifecycle where hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    Stop,
    SessionEnd,
}

impl FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_start" => Ok(Self::SessionStart),
            "user_prompt_submit" => Ok(Self::UserPromptSubmit),
            "pre_tool_use" => Ok(Self::PreToolUse),
            "post_tool_use" => Ok(Self::PostToolUse),
            "post_tool_use_failure" => Ok(Self::PostToolUseFailure),
            "stop" => Ok(Self::Stop),
            "session_end" => Ok(Self::SessionEnd),
            other => Err(anyhow!("unknown hook event: {other}")),
        }
    }
}

/// Context serialized into `HOOK_INPUT` for command hooks and handed to
/// inline handlers. Always carries the session identity; event-specific
/// fields are set where they apply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookInput {
    pub session_id: String,
    pub project_path: String,
    pub model: String,
    /// ISO 8601 timestamp of the triggering moment.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

impl HookInput {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        project_path: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_path: project_path.into(),
            model: model.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_tool_input(mut self, input: serde_json::Value) -> Self {
        self.tool_input = Some(input);
        self
    }

    #[must_use]
    pub fn with_tool_output(mut self, output: impl Into<String>) -> Self {
        self.tool_output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// What a handler decided. Only the first `block == true` output
/// short-circuits the event's pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HookOutput {
    #[serde(default)]
    pub block: bool,
    #[serde(default, alias = "blockReason")]
    pub block_reason: Option<String>,
    #[serde(default, alias = "modifiedInput")]
    pub modified_input: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, alias = "addContent")]
    pub add_content: Option<String>,
}

impl HookOutput {
    #[must_use]
    pub fn blocking(reason: impl Into<String>) -> Self {
        Self {
            block: true,
            block_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// In-process handler.
#[async_trait]
pub trait InlineHook: Send + Sync {
    async fn run(&self, input: &HookInput) -> anyhow::Result<HookOutput>;
}

/// Adapter so plain closures work as inline handlers.
struct FnHook<F>(F);

#[async_trait]
impl<F> InlineHook for FnHook<F>
where
    F: Fn(&HookInput) -> HookOutput + Send + Sync,
{
    async fn run(&self, input: &HookInput) -> anyhow::Result<HookOutput> {
        Ok((self.0)(input))
    }
}

pub enum HookAction {
    Inline(Arc<dyn InlineHook>),
    /// Shell command. Exit 0 + stdout ⇒ stdout parsed as a JSON HookOutput
    /// (best-effort); non-zero exit ⇒ synthesized block with stderr as the
    /// reason.
    Command(String),
}

pub struct HookDescriptor {
    pub id: String,
    pub event: HookEvent,
    /// Optional regex against the input's `tool_name`; a non-match skips the
    /// handler.
    pub matcher: Option<Regex>,
    pub action: HookAction,
    pub timeout: Duration,
    /// Fire-and-forget: spawned without consuming a result.
    pub async_hook: bool,
}

impl HookDescriptor {
    #[must_use]
    pub fn inline(
        id: impl Into<String>,
        event: HookEvent,
        handler: Arc<dyn InlineHook>,
    ) -> Self {
        Self {
            id: id.into(),
            event,
            matcher: None,
            action: HookAction::Inline(handler),
            timeout: DEFAULT_HOOK_TIMEOUT,
            async_hook: false,
        }
    }

    /// Inline hook from a synchronous closure.
    #[must_use]
    pub fn inline_fn<F>(id: impl Into<String>, event: HookEvent, f: F) -> Self
    where
        F: Fn(&HookInput) -> HookOutput + Send + Sync + 'static,
    {
        Self::inline(id, event, Arc::new(FnHook(f)))
    }

    #[must_use]
    pub fn command(id: impl Into<String>, event: HookEvent, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event,
            matcher: None,
            action: HookAction::Command(command.into()),
            timeout: DEFAULT_HOOK_TIMEOUT,
            async_hook: false,
        }
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: Regex) -> Self {
        self.matcher = Some(matcher);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn fire_and_forget(mut self) -> Self {
        self.async_hook = true;
        self
    }
}

/// Ordered per-event handler list.
#[derive(Default)]
pub struct HookPipeline {
    hooks: RwLock<Vec<Arc<HookDescriptor>>>,
}

impl HookPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: HookDescriptor) {
        self.hooks
            .write()
            .expect("hook pipeline lock")
            .push(Arc::new(descriptor));
    }

    /// Remove a hook by id. Returns whether anything was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let mut hooks = self.hooks.write().expect("hook pipeline lock");
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.read().expect("hook pipeline lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered handler for `event` in registration order,
    /// collecting their outputs. Handler failures and timeouts are logged and
    /// do not abort the pipeline; the first blocking output halts it.
    pub async fn execute(&self, event: HookEvent, input: &HookInput) -> Vec<HookOutput> {
        let hooks: Vec<_> = {
            let guard = self.hooks.read().expect("hook pipeline lock");
            guard.iter().filter(|h| h.event == event).cloned().collect()
        };

        let mut outputs = Vec::new();
        for hook in hooks {
            if let (Some(matcher), Some(tool_name)) = (&hook.matcher, &input.tool_name)
                && !matcher.is_match(tool_name)
            {
                continue;
            }

            if hook.async_hook {
                let hook = hook.clone();
                let input = input.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_hook(&hook, &input).await {
                        warn!("async hook {} failed: {e}", hook.id);
                    }
                });
                continue;
            }

            match run_hook(&hook, input).await {
                Ok(Some(output)) => {
                    let blocked = output.block;
                    outputs.push(output);
                    if blocked {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("hook {} failed: {e}", hook.id),
            }
        }

        outputs
    }
}

async fn run_hook(
    hook: &HookDescriptor,
    input: &HookInput,
) -> anyhow::Result<Option<HookOutput>> {
    match &hook.action {
        HookAction::Inline(handler) => {
            match tokio::time::timeout(hook.timeout, handler.run(input)).await {
                Ok(Ok(output)) => Ok(Some(output)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(anyhow!(
                    "inline hook timed out after {}s",
                    hook.timeout.as_secs()
                )),
            }
        }
        HookAction::Command(command) => run_command_hook(command, hook.timeout, input).await,
    }
}

async fn run_command_hook(
    command: &str,
    timeout: Duration,
    input: &HookInput,
) -> anyhow::Result<Option<HookOutput>> {
    let payload = serde_json::to_string(input)?;

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("HOOK_INPUT", payload)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("command hook timed out after {}s", timeout.as_secs()))??;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        // Best-effort: unparsable stdout is silently ignored.
        Ok(serde_json::from_str(stdout).ok())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let reason = if stderr.is_empty() {
            format!(
                "Hook exited with code {}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            stderr
        };
        Ok(Some(HookOutput::blocking(reason)))
    }
}
