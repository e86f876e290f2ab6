//! On-disk session persistence.
//!
//! The workspace keeps the current session at `.tern/history.json`; the
//! global store keeps one file per session under `~/.tern/sessions/` plus an
//! `index.json` so `continue` (last session) and `resume <name|id>` can
//! rehydrate. Single-writer: no cross-process locking is attempted.

use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Workspace-local data directory name.
pub const WORKSPACE_DIR: &str = ".tern";

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(String),
}

/// One row of the named-session index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub project_path: String,
    pub model: String,
    pub message_count: usize,
    #[serde(default)]
    pub preview: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIndex {
    #[serde(default)]
    last_session_id: Option<String>,
    #[serde(default)]
    sessions: HashMap<String, SessionIndexEntry>,
}

pub struct SessionStore {
    global_dir: PathBuf,
    workspace_root: PathBuf,
}

impl SessionStore {
    #[must_use]
    pub fn new(global_dir: PathBuf, workspace_root: PathBuf) -> Self {
        Self {
            global_dir,
            workspace_root,
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.global_dir.join("sessions")
    }

    fn index_path(&self) -> PathBuf {
        self.sessions_dir().join("index.json")
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json"))
    }

    fn history_path(&self) -> PathBuf {
        self.workspace_root.join(WORKSPACE_DIR).join("history.json")
    }

    /// Persist the session to the workspace history file and the global
    /// store, updating the index. A `name` makes the session resumable by
    /// that name; without one, any previously assigned name is kept.
    pub fn save(&self, session: &Session, name: Option<&str>) -> Result<(), SessionStoreError> {
        let json = serde_json::to_string_pretty(session)?;

        let history = self.history_path();
        if let Some(parent) = history.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&history, &json)?;

        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::write(self.session_path(&session.id), &json)?;

        let mut index = self.load_index();
        let existing_name = index
            .sessions
            .get(&session.id)
            .and_then(|e| e.name.clone());
        index.sessions.insert(
            session.id.clone(),
            SessionIndexEntry {
                id: session.id.clone(),
                name: name.map(str::to_string).or(existing_name),
                start_time: session.start_time,
                last_access_time: Utc::now(),
                project_path: session.meta.project_path.clone(),
                model: session.meta.model.clone(),
                message_count: session.message_count(),
                preview: session.preview(),
            },
        );
        index.last_session_id = Some(session.id.clone());
        self.write_index(&index)
    }

    /// Rehydrate the most recently saved session (`continue`).
    pub fn load_last(&self) -> Result<Session, SessionStoreError> {
        let index = self.load_index();
        let id = index
            .last_session_id
            .ok_or_else(|| SessionStoreError::NotFound("no previous session".to_string()))?;
        self.load(&id)
    }

    /// Rehydrate by id or by user-assigned name (`resume <name|id>`).
    pub fn resume(&self, key: &str) -> Result<Session, SessionStoreError> {
        if self.session_path(key).exists() {
            return self.load(key);
        }
        let index = self.load_index();
        let id = index
            .sessions
            .values()
            .find(|e| e.name.as_deref() == Some(key))
            .map(|e| e.id.clone())
            .ok_or_else(|| SessionStoreError::NotFound(key.to_string()))?;
        self.load(&id)
    }

    pub fn load(&self, id: &str) -> Result<Session, SessionStoreError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(SessionStoreError::NotFound(id.to_string()));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// The current workspace session, if one was saved here.
    pub fn load_history(&self) -> Result<Session, SessionStoreError> {
        let path = self.history_path();
        if !path.exists() {
            return Err(SessionStoreError::NotFound(
                path.display().to_string(),
            ));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Index entries, most recently accessed first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionIndexEntry> {
        let index = self.load_index();
        let mut entries: Vec<_> = index.sessions.into_values().collect();
        entries.sort_by(|a, b| b.last_access_time.cmp(&a.last_access_time));
        entries
    }

    /// Remove a session file and its index entry.
    pub fn delete(&self, id: &str) -> Result<(), SessionStoreError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(SessionStoreError::NotFound(id.to_string()));
        }
        std::fs::remove_file(path)?;

        let mut index = self.load_index();
        index.sessions.remove(id);
        if index.last_session_id.as_deref() == Some(id) {
            index.last_session_id = None;
        }
        self.write_index(&index)
    }

    /// A missing or corrupt index degrades to empty rather than failing.
    fn load_index(&self) -> SessionIndex {
        let path = self.index_path();
        if !path.exists() {
            return SessionIndex::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("corrupt session index, starting fresh: {e}");
                SessionIndex::default()
            }),
            Err(e) => {
                warn!("unreadable session index, starting fresh: {e}");
                SessionIndex::default()
            }
        }
    }

    fn write_index(&self, index: &SessionIndex) -> Result<(), SessionStoreError> {
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::write(self.index_path(), serde_json::to_string_pretty(index)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Message, TokenUsage, ToolCall};
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> SessionStore {
        SessionStore::new(dir.join("global"), dir.join("workspace"))
    }

    fn sample_session() -> Session {
        let mut session = Session::new("/tmp/project", "test-model");
        session.messages.push(Message::system("You are tern."));
        session.messages.push(Message::user("list files"));
        session.messages.push(
            Message::assistant("").with_tool_calls(vec![ToolCall::new(
                "call_1",
                "list_directory",
                r#"{"path":"."}"#,
            )]),
        );
        session.messages.push(Message::tool("call_1", "a.txt\nb.txt"));
        session.messages.push(Message::assistant("Two files."));
        session.note_tool_call("list_directory", true);
        session.add_usage(
            "test-model",
            &TokenUsage {
                prompt_tokens: 50,
                completion_tokens: 10,
                total_tokens: 60,
                ..TokenUsage::default()
            },
        );
        session
    }

    #[test]
    fn save_then_load_roundtrips_messages_and_counters() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let session = sample_session();

        store.save(&session, None).unwrap();
        let loaded = store.load(&session.id).unwrap();

        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.messages, session.messages);
        assert_eq!(loaded.meta, session.meta);
        assert_eq!(loaded.start_time, session.start_time);
    }

    #[test]
    fn save_writes_workspace_history() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let session = sample_session();
        store.save(&session, None).unwrap();

        let history = store.load_history().unwrap();
        assert_eq!(history.id, session.id);
    }

    #[test]
    fn resume_by_name_and_by_id() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let session = sample_session();
        store.save(&session, Some("demo")).unwrap();

        assert_eq!(store.resume("demo").unwrap().id, session.id);
        assert_eq!(store.resume(&session.id).unwrap().id, session.id);
        assert!(matches!(
            store.resume("missing"),
            Err(SessionStoreError::NotFound(_))
        ));
    }

    #[test]
    fn name_survives_unnamed_resave() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut session = sample_session();
        store.save(&session, Some("demo")).unwrap();

        session.messages.push(Message::user("more"));
        store.save(&session, None).unwrap();

        assert_eq!(store.resume("demo").unwrap().id, session.id);
    }

    #[test]
    fn load_last_returns_most_recent_save() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let first = sample_session();
        store.save(&first, None).unwrap();
        let second = sample_session();
        store.save(&second, None).unwrap();

        assert_eq!(store.load_last().unwrap().id, second.id);
    }

    #[test]
    fn index_uses_camel_case_layout() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let session = sample_session();
        store.save(&session, Some("demo")).unwrap();

        let raw = std::fs::read_to_string(store.index_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["lastSessionId"], session.id.as_str());
        let entry = &value["sessions"][session.id.as_str()];
        assert_eq!(entry["name"], "demo");
        assert_eq!(entry["projectPath"], "/tmp/project");
        assert_eq!(entry["messageCount"], 5);
        assert_eq!(entry["preview"], "list files");
        assert!(entry["startTime"].is_string());
    }

    #[test]
    fn delete_removes_file_and_index_entry() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let session = sample_session();
        store.save(&session, None).unwrap();

        store.delete(&session.id).unwrap();
        assert!(matches!(
            store.load(&session.id),
            Err(SessionStoreError::NotFound(_))
        ));
        assert!(store.load_last().is_err());
        assert!(matches!(
            store.delete(&session.id),
            Err(SessionStoreError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_index_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        std::fs::create_dir_all(store.sessions_dir()).unwrap();
        std::fs::write(store.index_path(), "{not json").unwrap();

        assert!(store.list().is_empty());
        let session = sample_session();
        store.save(&session, None).unwrap();
        assert_eq!(store.list().len(), 1);
    }
}
