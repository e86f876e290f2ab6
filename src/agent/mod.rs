//! Agent loop: bounded think/act iteration over the completion service.

mod observer;
pub mod subagent;

pub use observer::{AgentObserver, NullObserver};

use crate::hook::{HookEvent, HookInput, HookPipeline};
use crate::provider::{
    ChatRequest, CompletionApi, Message, TokenUsage, ToolResult, extract,
};
use crate::tool::{DispatchOutcome, ToolContext, ToolExecutor};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound on model calls per run.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
/// Spacing between word chunks when streaming final-turn content.
const CHUNK_DELAY: Duration = Duration::from_millis(20);

/// Outcome of one agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub content: String,
    /// Tool names in first-dispatch order, deduplicated.
    pub tools_used: Vec<String>,
    pub iterations: usize,
    pub api_time: Duration,
    pub tool_time: Duration,
    pub successful_tool_calls: u64,
    pub failed_tool_calls: u64,
    pub token_usage: TokenUsage,
}

/// One agent instance: a system prompt, a model, and the capability surface.
/// The orchestrator builds a fresh one per user turn.
pub struct Agent {
    client: Arc<dyn CompletionApi>,
    executor: Arc<ToolExecutor>,
    hooks: Arc<HookPipeline>,
    system_prompt: String,
    model: String,
    session_id: String,
    project_path: String,
    max_iterations: usize,
    chunk_delay: Duration,
}

impl Agent {
    #[must_use]
    pub fn new(
        client: Arc<dyn CompletionApi>,
        executor: Arc<ToolExecutor>,
        hooks: Arc<HookPipeline>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            executor,
            hooks,
            system_prompt: String::new(),
            model: model.into(),
            session_id: String::new(),
            project_path: ".".to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            chunk_delay: CHUNK_DELAY,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Session identity carried into hook contexts and tool contexts.
    #[must_use]
    pub fn with_session(
        mut self,
        session_id: impl Into<String>,
        project_path: impl Into<String>,
    ) -> Self {
        self.session_id = session_id.into();
        self.project_path = project_path.into();
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    #[cfg(test)]
    #[must_use]
    fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn hook_input(&self) -> HookInput {
        HookInput::new(&self.session_id, &self.project_path, &self.model)
    }

    /// Run one task to completion or iteration exhaustion.
    ///
    /// The transcript starts as system prompt + `prior_history` (replayed
    /// verbatim, in order) + the user message, and grows strictly
    /// append-only: one assistant message per iteration, then one tool-role
    /// message per tool call, in dispatch order.
    pub async fn run(
        &self,
        user_message: &str,
        observer: &dyn AgentObserver,
        prior_history: &[Message],
    ) -> Result<AgentResponse> {
        let mut messages = Vec::with_capacity(prior_history.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(self.system_prompt.clone()));
        }
        messages.extend_from_slice(prior_history);
        messages.push(Message::user(user_message));

        let tool_definitions = self.executor.registry().definitions();
        let tool_ctx = ToolContext::new(PathBuf::from(&self.project_path), &self.session_id);

        let mut response = AgentResponse::default();

        for iteration in 1..=self.max_iterations {
            response.iterations = iteration;

            let request = ChatRequest::new(self.model.clone(), messages.clone())
                .with_tools(tool_definitions.clone());

            let api_start = Instant::now();
            let completion = self
                .client
                .chat(request)
                .await
                .context("chat completion failed")?;
            response.api_time += api_start.elapsed();

            if let Some(usage) = &completion.usage {
                response.token_usage.add(usage);
            }

            let mut assistant = completion
                .message()
                .cloned()
                .context("completion returned no choices")?;
            // A no-op when the transport already normalized; covers stubbed
            // providers that hand back raw textual tool calls.
            extract::normalize_response_message(&mut assistant);

            let content = assistant
                .content
                .as_deref()
                .map(extract::strip_think)
                .unwrap_or_default();
            let tool_calls = assistant.tool_calls.unwrap_or_default();

            messages.push(Message::assistant(content.clone()).with_tool_calls(tool_calls.clone()));

            let is_final = tool_calls.is_empty();
            if !content.is_empty() {
                if is_final {
                    self.emit_word_by_word(&content, observer).await;
                } else {
                    observer.on_chunk(&format!("{content}\n\n"));
                }
                if !response.content.is_empty() {
                    response.content.push_str("\n\n");
                }
                response.content.push_str(&content);
            }

            if is_final {
                return Ok(response);
            }

            let mut results = Vec::with_capacity(tool_calls.len());
            for call in &tool_calls {
                let result = self
                    .dispatch_tool(call, &tool_ctx, observer, &mut response)
                    .await;
                results.push(result);
            }
            for result in results {
                messages.push(Message::tool(result.tool_call_id, result.content));
            }
        }

        // Iteration budget exhausted: report honestly with what accumulated.
        Ok(response)
    }

    async fn dispatch_tool(
        &self,
        call: &crate::provider::ToolCall,
        tool_ctx: &ToolContext,
        observer: &dyn AgentObserver,
        response: &mut AgentResponse,
    ) -> ToolResult {
        let name = call.name();
        let mut parsed_args = call.parsed_arguments().unwrap_or(serde_json::json!({}));

        let pre_input = self
            .hook_input()
            .with_tool_name(name)
            .with_tool_input(parsed_args.clone());
        let pre_outputs = self.hooks.execute(HookEvent::PreToolUse, &pre_input).await;
        if let Some(blocked) = pre_outputs.iter().find(|o| o.block) {
            let reason = blocked
                .block_reason
                .clone()
                .unwrap_or_else(|| "blocked".to_string());
            response.failed_tool_calls += 1;
            return ToolResult::error(&call.id, format!("Tool blocked by hook: {reason}"));
        }

        // A hook may amend the input; the last amendment wins.
        let mut effective_call = call.clone();
        if let Some(modified) = pre_outputs.into_iter().rev().find_map(|o| o.modified_input) {
            parsed_args = serde_json::Value::Object(modified);
            effective_call.function.arguments = parsed_args.to_string();
        }

        observer.on_tool_start(name, &parsed_args);

        let tool_start = Instant::now();
        let (result, outcome) = self
            .executor
            .execute_traced(&effective_call, tool_ctx)
            .await;
        let elapsed = tool_start.elapsed();
        response.tool_time += elapsed;

        if !response.tools_used.iter().any(|n| n == name) {
            response.tools_used.push(name.to_string());
        }
        if result.is_error {
            response.failed_tool_calls += 1;
        } else {
            response.successful_tool_calls += 1;
        }

        match outcome {
            DispatchOutcome::Completed => {
                let post_input = self
                    .hook_input()
                    .with_tool_name(name)
                    .with_tool_input(parsed_args)
                    .with_tool_output(&result.content)
                    .with_duration_ms(elapsed.as_millis() as u64);
                // Observed only: blocking outputs have nothing left to stop.
                self.hooks.execute(HookEvent::PostToolUse, &post_input).await;
                observer.on_tool_end(name, &result.content);
            }
            DispatchOutcome::HandlerFailed => {
                let failure_input = self
                    .hook_input()
                    .with_tool_name(name)
                    .with_tool_input(parsed_args)
                    .with_error(&result.content)
                    .with_duration_ms(elapsed.as_millis() as u64);
                self.hooks
                    .execute(HookEvent::PostToolUseFailure, &failure_input)
                    .await;
                observer.on_tool_end(name, "Error");
            }
            DispatchOutcome::Denied | DispatchOutcome::NotInvoked => {
                observer.on_tool_end(name, "Error");
            }
        }

        result
    }

    async fn emit_word_by_word(&self, content: &str, observer: &dyn AgentObserver) {
        let words: Vec<&str> = content.split(' ').collect();
        let last = words.len().saturating_sub(1);
        for (i, word) in words.iter().enumerate() {
            if i < last {
                observer.on_chunk(&format!("{word} "));
            } else {
                observer.on_chunk(word);
            }
            tokio::time::sleep(self.chunk_delay).await;
        }
    }
}
