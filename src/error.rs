use thiserror::Error;

/// Crate-wide failure surface. Component errors fold in via `From`; anything
/// that crosses the orchestrator boundary arrives as one of these. A failed
/// agent turn surfaces here without touching the running history.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad configuration: {0}")]
    Config(String),

    #[error("completion service: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("tool dispatch: {0}")]
    Tool(#[from] crate::tool::ToolError),

    #[error("memory store: {0}")]
    Memory(#[from] crate::memory::MemoryError),

    #[error("session persistence: {0}")]
    Session(#[from] crate::session::SessionStoreError),

    #[error("external tool server: {0}")]
    Mcp(#[from] crate::mcp::McpError),

    #[error("agent turn failed: {0}")]
    Agent(String),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
