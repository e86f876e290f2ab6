//! Streaming chunk types and tool-call delta aggregation.

use crate::provider::types::{ToolCall, UsageData};
use serde::Deserialize;
use std::collections::HashMap;

/// One SSE chunk from a streaming completion.
#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// A fragment of a tool call, keyed by `index` within the assistant turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Accumulates tool-call deltas for one `index` into a complete call.
#[derive(Debug, Default)]
pub struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallBuilder {
    pub fn merge(&mut self, delta: &ToolCallDelta) {
        if let Some(id) = &delta.id
            && !id.is_empty()
        {
            self.id = Some(id.clone());
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name
                && !name.is_empty()
            {
                self.name = Some(name.clone());
            }
            if let Some(fragment) = &function.arguments {
                self.arguments.push_str(fragment);
            }
        }
    }

    /// Finish the builder; `None` if no name was ever seen.
    #[must_use]
    pub fn finish(self, index: usize) -> Option<ToolCall> {
        let name = self.name?;
        let id = self
            .id
            .unwrap_or_else(|| format!("call_{}_{index}", chrono::Utc::now().timestamp_millis()));
        Some(ToolCall::new(id, name, self.arguments))
    }
}

/// Fold every delta in a chunk into the per-index builder map.
pub fn accumulate_deltas(chunk: &StreamChunk, builders: &mut HashMap<usize, ToolCallBuilder>) {
    for choice in &chunk.choices {
        if let Some(deltas) = &choice.delta.tool_calls {
            for delta in deltas {
                builders.entry(delta.index).or_default().merge(delta);
            }
        }
    }
}

/// Drain the builder map into complete calls, ordered by index.
#[must_use]
pub fn finish_tool_calls(builders: HashMap<usize, ToolCallBuilder>) -> Vec<ToolCall> {
    let mut entries: Vec<_> = builders.into_iter().collect();
    entries.sort_by_key(|(index, _)| *index);
    entries
        .into_iter()
        .filter_map(|(index, builder)| builder.finish(index))
        .collect()
}
