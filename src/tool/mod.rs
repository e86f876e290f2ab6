//! Tool registry and executor: the capability surface behind the approval gate.

pub mod builtin;
mod executor;
pub mod guard;
mod registry;
mod types;

pub use executor::{DispatchOutcome, MAX_TOOL_OUTPUT, TRUNCATION_MARKER, ToolExecutor};
pub use registry::ToolRegistry;
pub use types::{ApprovalHandler, ApprovalMode, Tool, ToolContext, ToolError, ToolOutput};
