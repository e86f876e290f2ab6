//! Orchestrator: assembles the system prompt, owns the multi-turn history,
//! and launches the agent loop.

use crate::agent::subagent::SubagentRegistry;
use crate::agent::{Agent, AgentObserver, AgentResponse, NullObserver};
use crate::hook::{HookEvent, HookInput, HookPipeline};
use crate::memory::{MemoryStore, SearchResult};
use crate::provider::CompletionApi;
use crate::session::Session;
use crate::tool::ToolExecutor;
use anyhow::{Result, anyhow};
use minijinja::{Environment, context};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Iteration bound handed to agents launched from `chat`.
pub const DEFAULT_MAX_TURNS: usize = 15;
/// How many memories a user message recalls.
const MEMORY_RECALL_LIMIT: usize = 5;
/// Cap on the shallow workspace listing.
const DIR_LISTING_LIMIT: usize = 40;
/// Workspace context file appended to the system prompt when present.
const CONTEXT_FILE: &str = "AGENTS.md";

const DEFAULT_BASE_INSTRUCTIONS: &str = "\
You are tern, a terminal coding agent. You help with software engineering tasks: \
reading, editing, and creating files, running commands, and searching codebases. \
Be concise. Prioritize action over explanation.

- Read code before modifying it; prefer editing existing files over creating new ones.
- Make minimal, focused changes. Implement completely, with no placeholder code.
- Use tools instead of guessing. State what you're doing in one or two sentences first.
- Reference files with line numbers, e.g. src/main.rs:42.
- Explain destructive commands before executing them.";

const SYSTEM_TEMPLATE: &str = r"{{ base_instructions }}
{% if memories %}
=== Long-Term Memory ===
{% for memory in memories %}- [{{ memory.kind }}] {{ memory.content }}
{% endfor %}=== End Long-Term Memory ===
{% endif %}
{% if listing %}
## Workspace

{{ listing }}
{% endif %}
{% if context_file %}
## Project Instructions

{{ context_file }}
{% endif %}
{% if extra_context %}
## Additional Context

{{ extra_context }}
{% endif %}
{% if plan_mode %}
## Plan Mode

Plan mode is active. Propose a plan and wait for approval before editing files
or running commands with side effects.
{% endif %}";

pub struct Orchestrator {
    client: Arc<dyn CompletionApi>,
    executor: Arc<ToolExecutor>,
    hooks: Arc<HookPipeline>,
    memory: Option<Arc<MemoryStore>>,
    subagents: SubagentRegistry,
    session: Session,
    env: Environment<'static>,
    base_instructions: String,
    project_path: PathBuf,
    workspace_listing: String,
    context_file: Option<String>,
    max_turns: usize,
    plan_mode: bool,
}

impl Orchestrator {
    /// Build an orchestrator rooted at `project_path`. The workspace listing
    /// and context file are read once, here.
    pub fn new(
        client: Arc<dyn CompletionApi>,
        executor: Arc<ToolExecutor>,
        hooks: Arc<HookPipeline>,
        model: impl Into<String>,
        project_path: PathBuf,
    ) -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("SYSTEM_TEMPLATE must be valid");

        let workspace_listing = load_workspace_listing(&project_path);
        let context_file = load_context_file(&project_path);
        let session = Session::new(project_path.display().to_string(), model);

        Self {
            client,
            executor,
            hooks,
            memory: None,
            subagents: SubagentRegistry::with_builtins(),
            session,
            env,
            base_instructions: DEFAULT_BASE_INSTRUCTIONS.to_string(),
            project_path,
            workspace_listing,
            context_file,
            max_turns: DEFAULT_MAX_TURNS,
            plan_mode: false,
        }
    }

    #[must_use]
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Replace the default instruction block entirely.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_instructions = prompt.into();
        self
    }

    #[must_use]
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    #[must_use]
    pub fn with_subagents(mut self, subagents: SubagentRegistry) -> Self {
        self.subagents = subagents;
        self
    }

    /// Resume from a rehydrated session instead of a fresh one.
    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    pub fn set_plan_mode(&mut self, on: bool) {
        self.plan_mode = on;
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn hook_input(&self) -> HookInput {
        HookInput::new(
            &self.session.id,
            self.project_path.display().to_string(),
            &self.session.meta.model,
        )
    }

    /// Fire `SessionStart`. Call once, after construction and external-tool
    /// registration, before the first chat.
    pub async fn init(&self) {
        self.hooks
            .execute(HookEvent::SessionStart, &self.hook_input())
            .await;
    }

    /// One user turn: hooks, memory recall, prompt assembly, agent run.
    pub async fn chat(
        &mut self,
        user_message: &str,
        observer: &dyn AgentObserver,
    ) -> Result<AgentResponse> {
        let prompt_input = self.hook_input().with_prompt(user_message);
        let outputs = self
            .hooks
            .execute(HookEvent::UserPromptSubmit, &prompt_input)
            .await;
        if let Some(blocked) = outputs.iter().find(|o| o.block) {
            let reason = blocked
                .block_reason
                .clone()
                .unwrap_or_else(|| "blocked".to_string());
            return Err(anyhow!("Prompt blocked by hook: {reason}"));
        }
        let extra_context: Vec<String> = outputs
            .into_iter()
            .filter_map(|o| o.add_content)
            .collect();

        let memories = self.recall_memories(user_message).await;
        let system_prompt = self.render_system_prompt(&memories, &extra_context)?;

        // Prior history is everything before this user message; the agent
        // re-appends it after its own system prompt.
        let prior = self.session.messages.clone();

        let agent = Agent::new(
            self.client.clone(),
            self.executor.clone(),
            self.hooks.clone(),
            self.session.meta.model.clone(),
        )
        .with_system_prompt(system_prompt)
        .with_session(self.session.id.clone(), self.project_path.display().to_string())
        .with_max_iterations(self.max_turns);

        let response = agent.run(user_message, observer, &prior).await?;

        // Only the user/assistant exchange is carried forward; the per-turn
        // tool transcript stays inside the agent.
        self.session
            .add_message(crate::provider::Message::user(user_message));
        self.session
            .add_message(crate::provider::Message::assistant(response.content.clone()));
        self.record_metrics(&response);

        let mut stop_input = self.hook_input();
        stop_input.message_count = Some(self.session.message_count());
        self.hooks.execute(HookEvent::Stop, &stop_input).await;

        Ok(response)
    }

    /// Run a predefined specialization against its restricted tool subset.
    /// Sub-agents do not share the main running history.
    pub async fn run_sub_agent(&self, name: &str, task: &str) -> Result<AgentResponse> {
        let config = self
            .subagents
            .get(name)
            .ok_or_else(|| anyhow!("unknown sub-agent: {name}"))?;

        let tool_names: Vec<&str> = config.tools.iter().map(String::as_str).collect();
        let subset = Arc::new(self.executor.registry().subset(&tool_names));
        let sub_executor = Arc::new(ToolExecutor::new(subset));
        sub_executor.set_approval_mode(self.executor.approval_mode());
        if let Some(handler) = self.executor.approval_handler() {
            sub_executor.set_approval_handler(handler);
        }

        let agent = Agent::new(
            self.client.clone(),
            sub_executor,
            self.hooks.clone(),
            self.session.meta.model.clone(),
        )
        .with_system_prompt(config.system_prompt.clone())
        .with_session(self.session.id.clone(), self.project_path.display().to_string())
        .with_max_iterations(config.max_turns);

        agent.run(task, &NullObserver, &[]).await
    }

    /// Fire `SessionEnd` with aggregate metrics. Call on final teardown.
    pub async fn shutdown(&self) {
        let mut input = self.hook_input();
        input.message_count = Some(self.session.message_count());
        input.tokens_used = Some(self.session.meta.total_tokens);
        self.hooks.execute(HookEvent::SessionEnd, &input).await;
    }

    async fn recall_memories(&self, query: &str) -> Vec<SearchResult> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        match memory.search(query, MEMORY_RECALL_LIMIT, None).await {
            Ok(results) => results,
            Err(e) => {
                warn!("memory recall failed: {e}");
                Vec::new()
            }
        }
    }

    fn render_system_prompt(
        &self,
        memories: &[SearchResult],
        extra_context: &[String],
    ) -> Result<String> {
        let memory_rows: Vec<_> = memories
            .iter()
            .map(|r| {
                context! {
                    kind => r.memory.r#type.as_str(),
                    content => r.memory.content,
                }
            })
            .collect();

        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            base_instructions => self.base_instructions,
            memories => memory_rows,
            listing => self.workspace_listing,
            context_file => self.context_file,
            extra_context => extra_context.join("\n"),
            plan_mode => self.plan_mode,
        })?;
        Ok(rendered.trim().to_string())
    }

    fn record_metrics(&mut self, response: &AgentResponse) {
        let model = self.session.meta.model.clone();
        self.session.add_usage(&model, &response.token_usage);
        self.session.add_api_time(response.api_time);
        self.session.add_tool_time(response.tool_time);
        for name in &response.tools_used {
            self.session.meta.tools_used.insert(name.clone());
        }
        self.session.meta.successful_tool_calls += response.successful_tool_calls;
        self.session.meta.failed_tool_calls += response.failed_tool_calls;
        debug!(
            iterations = response.iterations,
            tools = response.tools_used.len(),
            "agent turn finished"
        );
    }
}

/// Shallow, sorted root listing; directories carry a trailing slash, hidden
/// entries are skipped, and the tail is elided past the cap.
fn load_workspace_listing(root: &Path) -> String {
    let Ok(entries) = std::fs::read_dir(root) else {
        return String::new();
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                return None;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            Some(if is_dir { format!("{name}/") } else { name })
        })
        .collect();
    names.sort();

    if names.len() > DIR_LISTING_LIMIT {
        let elided = names.len() - DIR_LISTING_LIMIT;
        names.truncate(DIR_LISTING_LIMIT);
        names.push(format!("... and {elided} more"));
    }
    names.join("\n")
}

fn load_context_file(root: &Path) -> Option<String> {
    let path = root.join(CONTEXT_FILE);
    std::fs::read_to_string(path).ok()
}
