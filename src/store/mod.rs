//! Session data model and persistence.
//!
//! A [`Session`] pairs immutable request metadata with a mutable,
//! opaquely-versioned [`ResearchState`] document. The store never inspects
//! `ResearchState` field semantics; callers pass a mutator closure to
//! [`SessionStore::update`] and the store applies it atomically, bumping
//! the version.

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;

/// Coarse control over how many supervisor iterations / researchers a
/// session is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Shallow,
    Medium,
    Deep,
}

impl Default for Depth {
    fn default() -> Self {
        Depth::Medium
    }
}

/// The state-machine stage a session currently occupies (§4.6 of the
/// originating design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Clarify,
    Brief,
    Supervise,
    Research,
    Compress,
    Finalise,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub question: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub subtask_ref: usize,
    pub text: String,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub stage: Stage,
    pub message: String,
    pub recoverable: bool,
}

/// The single mutable document a session carries through the workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchState {
    pub clarified_goal: Option<String>,
    pub brief: Option<String>,
    pub subtasks: Vec<Subtask>,
    pub summaries: Vec<Summary>,
    pub iteration: u32,
    pub compressed: Option<String>,
    pub final_report: Option<String>,
    pub errors: Vec<RecordedError>,
}

impl ResearchState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Immutable request metadata captured at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    pub query: String,
    pub language: Option<crate::registry::Language>,
    pub depth: Depth,
    pub max_researchers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub query: String,
    pub language: crate::registry::Language,
    pub depth: Depth,
    pub max_researchers: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage: Stage,
    pub progress: u8,
    pub version: u64,
    pub state: ResearchState,
    pub error_message: Option<String>,
}

impl Session {
    fn new(id: String, spec: SessionSpec, language: crate::registry::Language) -> Self {
        let now = Utc::now();
        Self {
            id,
            query: spec.query,
            language,
            depth: spec.depth,
            max_researchers: spec.max_researchers,
            created_at: now,
            updated_at: now,
            stage: Stage::Intake,
            progress: 0,
            version: 0,
            state: ResearchState::new(),
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub stage: Option<Stage>,
}

impl SessionFilter {
    fn matches(&self, session: &Session) -> bool {
        match self.stage {
            Some(stage) => session.stage == stage,
            None => true,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum SessionStoreError {
    #[error("session not found: {id}")]
    #[diagnostic(code(deepresearch::store::not_found))]
    NotFound { id: String },

    #[error("backend error: {message}")]
    #[diagnostic(code(deepresearch::store::backend))]
    Backend { message: String },

    #[error("version conflict updating session {id}: expected {expected}, found {found}")]
    #[diagnostic(
        code(deepresearch::store::version_conflict),
        help("Another writer updated this session concurrently; retry the mutation against the fresh version.")
    )]
    VersionConflict { id: String, expected: u64, found: u64 },
}

pub type Result<T> = std::result::Result<T, SessionStoreError>;

/// Mutates a session's `ResearchState` (and, when needed, `stage`/`progress`)
/// in place. Returning `Err` aborts the update without persisting changes.
pub type Mutator = dyn FnOnce(&mut Session) + Send;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, spec: SessionSpec) -> Result<Session>;
    async fn load(&self, id: &str) -> Result<Option<Session>>;
    async fn update(&self, id: &str, mutator: Box<Mutator>) -> Result<Session>;
    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Volatile, process-local session store backed by a lock-guarded map.
/// Used for tests and embedding; see [`sqlite::SqliteSessionStore`] for the
/// durable backend.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<FxHashMap<String, Session>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<dyn SessionStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, spec: SessionSpec) -> Result<Session> {
        let language = spec.language.unwrap_or_else(|| crate::registry::detect(&spec.query));
        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), spec, language);
        self.sessions.write().insert(id, session.clone());
        Ok(session)
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn update(&self, id: &str, mutator: Box<Mutator>) -> Result<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id).ok_or_else(|| SessionStoreError::NotFound {
            id: id.to_string(),
        })?;
        mutator(session);
        session.version += 1;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SessionStoreError::NotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Language;

    fn spec(query: &str) -> SessionSpec {
        SessionSpec {
            query: query.to_string(),
            language: None,
            depth: Depth::Medium,
            max_researchers: 3,
        }
    }

    #[tokio::test]
    async fn create_then_load_round_trips_immutable_fields() {
        let store = InMemorySessionStore::new();
        let created = store.create(spec("quantum computing trends")).await.unwrap();
        let loaded = store.load(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.query, created.query);
        assert_eq!(loaded.depth, created.depth);
        assert_eq!(loaded.stage, Stage::Intake);
    }

    #[tokio::test]
    async fn update_is_atomic_and_bumps_version() {
        let store = InMemorySessionStore::new();
        let created = store.create(spec("hello")).await.unwrap();
        let updated = store
            .update(
                &created.id,
                Box::new(|s: &mut Session| {
                    s.stage = Stage::Clarify;
                    s.progress = 10;
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.stage, Stage::Clarify);
        assert_eq!(updated.progress, 10);
    }

    #[tokio::test]
    async fn update_unknown_session_errors() {
        let store = InMemorySessionStore::new();
        let err = store
            .update("missing", Box::new(|_: &mut Session| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_stage() {
        let store = InMemorySessionStore::new();
        let a = store.create(spec("a")).await.unwrap();
        let _b = store.create(spec("b")).await.unwrap();
        store
            .update(
                &a.id,
                Box::new(|s: &mut Session| s.stage = Stage::Completed),
            )
            .await
            .unwrap();

        let completed = store
            .list(SessionFilter {
                stage: Some(Stage::Completed),
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, a.id);
    }

    #[tokio::test]
    async fn language_is_detected_when_unspecified() {
        let store = InMemorySessionStore::new();
        let created = store
            .create(spec("양자 컴퓨팅의 최신 동향"))
            .await
            .unwrap();
        assert_eq!(created.language, Language::Ko);
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = InMemorySessionStore::new();
        let created = store.create(spec("x")).await.unwrap();
        store.delete(&created.id).await.unwrap();
        assert!(store.load(&created.id).await.unwrap().is_none());
    }
}
