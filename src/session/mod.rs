//! In-memory session: transcript plus cumulative metrics.

mod store;

pub use store::{SessionIndexEntry, SessionStore, SessionStoreError};

use crate::provider::{Message, Role, TokenUsage};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// High-water mark on the transcript before compression kicks in.
pub const DEFAULT_MAX_MESSAGES: usize = 100;
/// How many recent messages survive compression untouched.
const KEEP_RECENT: usize = 20;
/// Topic hint: up to this many removed user messages contribute.
const TOPIC_HINT_MESSAGES: usize = 5;
/// Topic hint: first chars taken from each contributing message.
const TOPIC_HINT_CHARS: usize = 50;

/// Cumulative per-session metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub project_path: String,
    pub model: String,
    pub total_tokens: u64,
    pub tools_used: BTreeSet<String>,
    pub successful_tool_calls: u64,
    pub failed_tool_calls: u64,
    pub api_time_ms: u64,
    pub tool_time_ms: u64,
    /// Per-model token breakdown.
    #[serde(default)]
    pub model_tokens: HashMap<String, TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub meta: SessionMeta,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

/// Session id: local timestamp plus a short random suffix.
fn generate_session_id() -> String {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let suffix = &uuid::Uuid::new_v4().to_string()[..4];
    format!("{timestamp}-{suffix}")
}

impl Session {
    #[must_use]
    pub fn new(project_path: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: generate_session_id(),
            start_time: Utc::now(),
            messages: Vec::new(),
            meta: SessionMeta {
                project_path: project_path.into(),
                model: model.into(),
                ..SessionMeta::default()
            },
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Append a message, compressing once the high-water mark is crossed.
    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        if self.messages.len() > self.max_messages {
            self.compress_history();
        }
    }

    pub fn note_tool_call(&mut self, name: &str, success: bool) {
        self.meta.tools_used.insert(name.to_string());
        if success {
            self.meta.successful_tool_calls += 1;
        } else {
            self.meta.failed_tool_calls += 1;
        }
    }

    pub fn add_usage(&mut self, model: &str, usage: &TokenUsage) {
        self.meta.total_tokens += usage.total_tokens;
        self.meta
            .model_tokens
            .entry(model.to_string())
            .or_default()
            .merge(usage);
    }

    pub fn add_api_time(&mut self, elapsed: Duration) {
        self.meta.api_time_ms += elapsed.as_millis() as u64;
    }

    pub fn add_tool_time(&mut self, elapsed: Duration) {
        self.meta.tool_time_ms += elapsed.as_millis() as u64;
    }

    /// First user message, truncated for index previews.
    #[must_use]
    pub fn preview(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| {
                let text = m.content.as_text();
                if text.chars().count() > 100 {
                    format!("{}...", text.chars().take(100).collect::<String>())
                } else {
                    text
                }
            })
    }

    /// Collapse the middle of the transcript into one assistant placeholder.
    ///
    /// A leading system message is preserved; the most recent messages are
    /// kept verbatim; everything in between is replaced by a summary line
    /// carrying the removed count and a topic hint drawn from removed user
    /// messages.
    pub fn compress_history(&mut self) {
        let has_system = self
            .messages
            .first()
            .is_some_and(|m| m.role == Role::System);
        let head = usize::from(has_system);

        if self.messages.len() <= head + KEEP_RECENT {
            return;
        }

        let tail_start = self.messages.len() - KEEP_RECENT;
        let removed = &self.messages[head..tail_start];
        if removed.is_empty() {
            return;
        }

        let topics: Vec<String> = removed
            .iter()
            .filter(|m| m.role == Role::User)
            .take(TOPIC_HINT_MESSAGES)
            .map(|m| {
                m.content
                    .as_text()
                    .chars()
                    .take(TOPIC_HINT_CHARS)
                    .collect()
            })
            .collect();

        let summary = if topics.is_empty() {
            format!(
                "[Previous conversation compressed: {} messages removed]",
                removed.len()
            )
        } else {
            format!(
                "[Previous conversation compressed: {} messages removed. Topics: {}]",
                removed.len(),
                topics.join(", ")
            )
        };

        let mut compressed = Vec::with_capacity(head + 1 + KEEP_RECENT);
        if has_system {
            compressed.push(self.messages[0].clone());
        }
        compressed.push(Message::assistant(summary));
        compressed.extend_from_slice(&self.messages[tail_start..]);
        self.messages = compressed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_timestamp_and_suffix() {
        let session = Session::new("/tmp/p", "test-model");
        let parts: Vec<&str> = session.id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn compression_preserves_system_and_recent_tail() {
        let mut session = Session::new("/tmp/p", "m");
        session.messages.push(Message::system("You are tern."));
        for i in 0..150 {
            session.messages.push(Message::user(format!("question {i}")));
            session.messages.push(Message::assistant(format!("answer {i}")));
        }

        session.compress_history();

        assert_eq!(session.messages.len(), 2 + KEEP_RECENT);
        assert_eq!(session.messages[0].role, Role::System);
        assert_eq!(session.messages[1].role, Role::Assistant);
        let summary = session.messages[1].content.as_text();
        assert!(summary.starts_with("[Previous conversation compressed:"));
        assert!(summary.contains("280 messages removed"));
        assert!(summary.contains("question 0"));

        // Last 20 originals survive in order.
        let tail = &session.messages[2..];
        assert_eq!(tail[0].content.as_text(), "question 140");
        assert_eq!(tail[KEEP_RECENT - 1].content.as_text(), "answer 149");
    }

    #[test]
    fn compression_without_system_message() {
        let mut session = Session::new("/tmp/p", "m");
        for i in 0..40 {
            session.messages.push(Message::user(format!("u{i}")));
        }
        session.compress_history();
        assert_eq!(session.messages.len(), 1 + KEEP_RECENT);
        assert_eq!(session.messages[0].role, Role::Assistant);
    }

    #[test]
    fn compression_is_noop_on_short_transcripts() {
        let mut session = Session::new("/tmp/p", "m");
        session.messages.push(Message::system("sys"));
        session.messages.push(Message::user("hello"));
        session.compress_history();
        assert_eq!(session.messages.len(), 2);
    }

    #[test]
    fn topic_hint_caps_at_five_user_messages() {
        let mut session = Session::new("/tmp/p", "m");
        for i in 0..30 {
            session.messages.push(Message::user(format!("topic-{i}")));
        }
        session.compress_history();
        let summary = session.messages[0].content.as_text();
        assert!(summary.contains("topic-4"));
        assert!(!summary.contains("topic-5,"));
    }

    #[test]
    fn add_message_auto_compresses_past_high_water() {
        let mut session = Session::new("/tmp/p", "m");
        session.max_messages = 30;
        for i in 0..40 {
            session.add_message(Message::user(format!("m{i}")));
        }
        assert!(session.messages.len() <= 30);
    }

    #[test]
    fn counters_accumulate() {
        let mut session = Session::new("/tmp/p", "m");
        session.note_tool_call("read_file", true);
        session.note_tool_call("read_file", true);
        session.note_tool_call("shell", false);
        assert_eq!(session.meta.successful_tool_calls, 2);
        assert_eq!(session.meta.failed_tool_calls, 1);
        assert_eq!(session.meta.tools_used.len(), 2);

        session.add_usage(
            "m",
            &TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                ..TokenUsage::default()
            },
        );
        assert_eq!(session.meta.total_tokens, 15);
        assert_eq!(session.meta.model_tokens["m"].prompt_tokens, 10);
    }

    #[test]
    fn preview_truncates_long_first_user_message() {
        let mut session = Session::new("/tmp/p", "m");
        session.messages.push(Message::system("sys"));
        session.messages.push(Message::user("x".repeat(150)));
        let preview = session.preview().unwrap();
        assert_eq!(preview.chars().count(), 103);
        assert!(preview.ends_with("..."));
    }
}
