//! Observer interface for the interactive renderer.
//!
//! The core never inspects UI state; it reports through this narrow surface
//! and accepts the null object when nobody is watching. Callbacks may fire
//! while the loop is suspended but must not re-enter it.

/// Callbacks the renderer implements. All methods default to no-ops.
pub trait AgentObserver: Send + Sync {
    /// A piece of assistant text. Final-turn content arrives word by word;
    /// intermediate-turn content arrives as one chunk ending in a blank line.
    fn on_chunk(&self, _text: &str) {}

    /// A tool is about to run with these parsed arguments.
    fn on_tool_start(&self, _name: &str, _args: &serde_json::Value) {}

    /// A tool finished; `output` is its body, or `"Error"` on failure.
    fn on_tool_end(&self, _name: &str, _output: &str) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl AgentObserver for NullObserver {}
