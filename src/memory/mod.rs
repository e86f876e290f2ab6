//! Long-term memory: durable typed records with optional embedding vectors
//! and similarity search.
//!
//! Backed by a single SQLite table under the user's data directory. Metadata
//! and embeddings live as JSON text inside cells and are parsed to typed
//! values at the boundary. rusqlite is synchronous, so the async operations
//! (`remember`, `search`) push their statements onto `spawn_blocking` tasks;
//! the remaining accessors are blocking and say so.

use crate::provider::{Embedder, Reranker};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

/// Records below this cosine similarity are not considered candidates.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.7;
/// Candidate pool handed to the reranker.
const CANDIDATE_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Preference,
    Mistake,
    Knowledge,
    TaskContext,
}

impl MemoryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Mistake => "mistake",
            Self::Knowledge => "knowledge",
            Self::TaskContext => "task_context",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "preference" => Self::Preference,
            "mistake" => Self::Mistake,
            "task_context" => Self::TaskContext,
            _ => Self::Knowledge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub r#type: MemoryType,
    pub metadata: serde_json::Value,
    /// Empty when the embedding call failed at `remember` time; such records
    /// are stored but never returned by similarity search.
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub memory: Memory,
    pub similarity: f32,
}

pub struct MemoryStore {
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl MemoryStore {
    /// Open or create the store at `path` (e.g. `~/.tern/memory.db`).
    pub fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Connection::open(path)?;
        db.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS memories (
                id         TEXT PRIMARY KEY,
                content    TEXT NOT NULL,
                type       TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                embedding  TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
            ",
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            embedder,
            reranker: None,
        })
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Persist a new memory, embedding its content. An embedding failure is
    /// logged and the record is stored with an empty vector.
    pub async fn remember(
        &self,
        content: &str,
        r#type: MemoryType,
        metadata: serde_json::Value,
    ) -> Result<Memory, MemoryError> {
        let embedding = match self.embedder.embed(content).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("embedding failed, storing memory without vector: {e}");
                Vec::new()
            }
        };

        let now = Utc::now();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            r#type,
            metadata,
            embedding,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.clone();
        let record = memory.clone();
        tokio::task::spawn_blocking(move || {
            let db = db.lock().expect("memory db lock");
            db.execute(
                r"
                INSERT INTO memories (id, content, type, metadata, embedding, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    record.id,
                    record.content,
                    record.r#type.as_str(),
                    serde_json::to_string(&record.metadata)?,
                    serde_json::to_string(&record.embedding)?,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok::<(), MemoryError>(())
        })
        .await
        .map_err(|e| MemoryError::Task(e.to_string()))??;

        Ok(memory)
    }

    /// Semantic search over embedded records.
    ///
    /// Embeds the query (failure ⇒ empty result), ranks all embedded records
    /// by cosine similarity, keeps those at or above `min_similarity`
    /// (default 0.7) capped to the candidate pool, then lets the reranker
    /// reorder if one is configured, falling back to cosine order on any
    /// rerank failure.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchResult>, MemoryError> {
        let query_vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("query embedding failed, returning no memories: {e}");
                return Ok(Vec::new());
            }
        };

        let threshold = min_similarity.unwrap_or(DEFAULT_MIN_SIMILARITY);
        let db = self.db.clone();
        let mut candidates =
            tokio::task::spawn_blocking(move || rank_by_cosine(&db, &query_vector, threshold))
                .await
                .map_err(|e| MemoryError::Task(e.to_string()))??;
        candidates.truncate(CANDIDATE_LIMIT);

        if let Some(reranker) = &self.reranker
            && !candidates.is_empty()
        {
            let documents: Vec<String> =
                candidates.iter().map(|c| c.memory.content.clone()).collect();
            match reranker.rerank(query, &documents, limit).await {
                Ok(scores) => {
                    let mut reranked: Vec<SearchResult> = scores
                        .into_iter()
                        .filter_map(|r| {
                            candidates.get(r.index).map(|c| SearchResult {
                                memory: c.memory.clone(),
                                similarity: r.score,
                            })
                        })
                        .collect();
                    reranked.sort_by(|a, b| {
                        b.similarity
                            .partial_cmp(&a.similarity)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    reranked.truncate(limit);
                    return Ok(reranked);
                }
                Err(e) => warn!("rerank failed, falling back to cosine order: {e}"),
            }
        }

        candidates.truncate(limit);
        Ok(candidates)
    }

    /// Blocking (rusqlite is synchronous); callers on an async task should
    /// wrap this in `spawn_blocking`.
    pub fn get(&self, id: &str) -> Result<Option<Memory>, MemoryError> {
        let db = self.db.lock().expect("memory db lock");
        let mut stmt = db.prepare(
            r"
            SELECT id, content, type, metadata, embedding, created_at, updated_at
            FROM memories WHERE id = ?1
            ",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_memory)?;
        rows.next().transpose().map_err(MemoryError::Database)
    }

    /// Remove one memory. Returns whether it existed. Blocking, like
    /// [`get`](Self::get).
    pub fn forget(&self, id: &str) -> Result<bool, MemoryError> {
        let db = self.db.lock().expect("memory db lock");
        let affected = db.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Drop every memory. Returns how many were removed. Blocking, like
    /// [`get`](Self::get).
    pub fn clear(&self) -> Result<usize, MemoryError> {
        let db = self.db.lock().expect("memory db lock");
        let affected = db.execute("DELETE FROM memories", [])?;
        Ok(affected)
    }

    pub fn count(&self) -> Result<usize, MemoryError> {
        let db = self.db.lock().expect("memory db lock");
        let count: i64 = db.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// All embedded records scored against `query_vector`, best first.
fn rank_by_cosine(
    db: &Mutex<Connection>,
    query_vector: &[f32],
    threshold: f32,
) -> Result<Vec<SearchResult>, MemoryError> {
    let records = {
        let db = db.lock().expect("memory db lock");
        let mut stmt = db.prepare(
            r"
            SELECT id, content, type, metadata, embedding, created_at, updated_at
            FROM memories WHERE embedding != '[]'
            ",
        )?;
        let rows = stmt
            .query_map([], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut results: Vec<SearchResult> = records
        .into_iter()
        .map(|memory| {
            let similarity = cosine_similarity(query_vector, &memory.embedding);
            SearchResult { memory, similarity }
        })
        .filter(|r| r.similarity >= threshold)
        .collect();

    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(results)
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let metadata_json: String = row.get(3)?;
    let embedding_json: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let type_str: String = row.get(2)?;

    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        r#type: MemoryType::from_db(&type_str),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        embedding: serde_json::from_str(&embedding_json).unwrap_or_default(),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Cosine similarity with the degenerate cases pinned to 0: differing
/// dimensions or a zero-norm side never produce NaN.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, RerankResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    /// Deterministic embedder: maps text into a small vector by hashing
    /// bytes into buckets, then normalizing. Identical text ⇒ identical
    /// vector. Can be switched into failure mode.
    struct HashEmbedder {
        fail: AtomicBool,
    }

    impl HashEmbedder {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::Network("embedder down".to_string()));
            }
            let mut vector = vec![0.0f32; 8];
            for (i, byte) in text.bytes().enumerate() {
                vector[(byte as usize + i) % 8] += 1.0;
            }
            Ok(vector)
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(
            &self,
            _: &str,
            _: &[String],
            _: usize,
        ) -> Result<Vec<RerankResult>, ProviderError> {
            Err(ProviderError::Api {
                status: 500,
                message: "rerank unavailable".to_string(),
            })
        }
    }

    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(
            &self,
            _: &str,
            documents: &[String],
            top_n: usize,
        ) -> Result<Vec<RerankResult>, ProviderError> {
            Ok(documents
                .iter()
                .enumerate()
                .rev()
                .take(top_n)
                .enumerate()
                .map(|(rank, (index, _))| RerankResult {
                    index,
                    score: 1.0 - rank as f32 * 0.1,
                })
                .collect())
        }
    }

    fn open_store(dir: &Path) -> (MemoryStore, Arc<HashEmbedder>) {
        let embedder = Arc::new(HashEmbedder::new());
        let store = MemoryStore::open(&dir.join("memory.db"), embedder.clone()).unwrap();
        (store, embedder)
    }

    #[tokio::test]
    async fn remember_then_search_finds_exact_content() {
        let dir = tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        let memory = store
            .remember("prefer tabs", MemoryType::Preference, serde_json::json!({}))
            .await
            .unwrap();

        let results = store.search("prefer tabs", 5, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, memory.id);
        assert!(results[0].similarity >= 0.99);
    }

    #[tokio::test]
    async fn embedding_failure_persists_without_vector() {
        let dir = tempdir().unwrap();
        let (store, embedder) = open_store(dir.path());

        embedder.fail.store(true, Ordering::SeqCst);
        let memory = store
            .remember("orphan", MemoryType::Knowledge, serde_json::json!({}))
            .await
            .unwrap();
        assert!(memory.embedding.is_empty());
        embedder.fail.store(false, Ordering::SeqCst);

        // Stored, retrievable by id, but invisible to similarity search.
        assert!(store.get(&memory.id).unwrap().is_some());
        let results = store.search("orphan", 5, Some(0.0)).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn query_embedding_failure_returns_empty() {
        let dir = tempdir().unwrap();
        let (store, embedder) = open_store(dir.path());
        store
            .remember("something", MemoryType::Knowledge, serde_json::json!({}))
            .await
            .unwrap();

        embedder.fail.store(true, Ordering::SeqCst);
        let results = store.search("something", 5, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn results_respect_threshold_and_order() {
        let dir = tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        store
            .remember("alpha beta gamma", MemoryType::Knowledge, serde_json::json!({}))
            .await
            .unwrap();
        store
            .remember("alpha beta delta", MemoryType::Knowledge, serde_json::json!({}))
            .await
            .unwrap();
        store
            .remember("zzzzzzz", MemoryType::Knowledge, serde_json::json!({}))
            .await
            .unwrap();

        let results = store.search("alpha beta gamma", 10, Some(0.5)).await.unwrap();
        assert!(!results.is_empty());
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        for r in &results {
            assert!(r.similarity >= 0.5);
        }
        assert_eq!(results[0].memory.content, "alpha beta gamma");
    }

    #[tokio::test]
    async fn rerank_failure_falls_back_to_cosine() {
        let dir = tempdir().unwrap();
        let embedder = Arc::new(HashEmbedder::new());
        let store = MemoryStore::open(&dir.path().join("memory.db"), embedder)
            .unwrap()
            .with_reranker(Arc::new(FailingReranker));

        store
            .remember("prefer tabs", MemoryType::Preference, serde_json::json!({}))
            .await
            .unwrap();

        let results = store.search("prefer tabs", 3, Some(0.5)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content, "prefer tabs");
    }

    #[tokio::test]
    async fn rerank_scores_replace_cosine() {
        let dir = tempdir().unwrap();
        let embedder = Arc::new(HashEmbedder::new());
        let store = MemoryStore::open(&dir.path().join("memory.db"), embedder)
            .unwrap()
            .with_reranker(Arc::new(ReversingReranker));

        store
            .remember("red green blue", MemoryType::Knowledge, serde_json::json!({}))
            .await
            .unwrap();
        store
            .remember("red green bluX", MemoryType::Knowledge, serde_json::json!({}))
            .await
            .unwrap();

        let results = store.search("red green blue", 2, Some(0.1)).await.unwrap();
        assert_eq!(results.len(), 2);
        // The reversing reranker demotes the cosine-best candidate.
        assert_eq!(results[0].similarity, 1.0);
        assert_ne!(results[0].memory.content, "red green blue");
    }

    #[tokio::test]
    async fn get_forget_clear() {
        let dir = tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        let m = store
            .remember("fact", MemoryType::Knowledge, serde_json::json!({"k": 1}))
            .await
            .unwrap();
        let loaded = store.get(&m.id).unwrap().unwrap();
        assert_eq!(loaded.content, "fact");
        assert_eq!(loaded.metadata["k"], 1);
        assert_eq!(loaded.r#type, MemoryType::Knowledge);
        assert_eq!(loaded.created_at.timestamp(), m.created_at.timestamp());

        assert!(store.forget(&m.id).unwrap());
        assert!(!store.forget(&m.id).unwrap());
        assert!(store.get(&m.id).unwrap().is_none());

        store
            .remember("a", MemoryType::Mistake, serde_json::json!({}))
            .await
            .unwrap();
        store
            .remember("b", MemoryType::TaskContext, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(store.clear().unwrap(), 2);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn cosine_degenerate_cases_are_zero_not_nan() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        let value = cosine_similarity(&[0.0; 4], &[0.0; 4]);
        assert!(!value.is_nan());
        assert_eq!(value, 0.0);
    }

    #[test]
    fn cosine_identical_vectors_are_one() {
        let v = vec![0.3, 0.5, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }
}
