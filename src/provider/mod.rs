//! Completion-service client: chat (plain and streaming), embeddings, rerank.

mod client;
mod error;
pub mod extract;
mod sse;
pub mod stream;
mod types;

pub use client::{CompletionApi, CompletionClient, Embedder, Reranker, RerankResult};
pub use error::ProviderError;
pub use sse::{SseEvent, SseParser};
pub use types::{
    ChatRequest, ChatResponse, Choice, CompletionTokensDetails, ContentPart, FunctionCall,
    ImageUrl, Message, MessageContent, PromptTokensDetails, ResponseMessage, Role, StreamEvent,
    TokenUsage, ToolCall, ToolDefinition, ToolResult, UsageData,
};
