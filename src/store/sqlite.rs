//! Durable `SessionStore` backed by SQLite, mirroring the optimistic
//! versioning the in-memory store provides. Immutable metadata and the
//! mutable `ResearchState` document live in one row per session; the
//! `version` column is the persisted form of §4.4's "monotonic version".

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use super::{
    ResearchState, Result, Session, SessionFilter, SessionSpec, SessionStore, SessionStoreError,
    Stage,
};
use crate::registry::Language;

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Connect (creating the database file and schema if needed) to the
    /// given SQLite URL, e.g. `sqlite://sessions.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(url)
            .await
            .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                language TEXT NOT NULL,
                depth TEXT NOT NULL,
                max_researchers INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                stage TEXT NOT NULL,
                progress INTEGER NOT NULL,
                version INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;
        Ok(())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<Session, String> {
        let state_json: String = row.try_get("state_json").map_err(|e| e.to_string())?;
        let state: ResearchState = serde_json::from_str(&state_json).map_err(|e| e.to_string())?;
        let language_str: String = row.try_get("language").map_err(|e| e.to_string())?;
        let depth_str: String = row.try_get("depth").map_err(|e| e.to_string())?;
        let stage_str: String = row.try_get("stage").map_err(|e| e.to_string())?;

        Ok(Session {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            query: row.try_get("query").map_err(|e| e.to_string())?,
            language: parse_language(&language_str),
            depth: parse_depth(&depth_str),
            max_researchers: row
                .try_get::<i64, _>("max_researchers")
                .map_err(|e| e.to_string())? as usize,
            created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
            updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
            stage: parse_stage(&stage_str),
            progress: row.try_get::<i64, _>("progress").map_err(|e| e.to_string())? as u8,
            version: row.try_get::<i64, _>("version").map_err(|e| e.to_string())? as u64,
            state,
            error_message: row.try_get("error_message").map_err(|e| e.to_string())?,
        })
    }
}

fn parse_language(s: &str) -> Language {
    match s {
        "ko" => Language::Ko,
        _ => Language::En,
    }
}

fn depth_str(d: super::Depth) -> &'static str {
    match d {
        super::Depth::Shallow => "shallow",
        super::Depth::Medium => "medium",
        super::Depth::Deep => "deep",
    }
}

fn parse_depth(s: &str) -> super::Depth {
    match s {
        "shallow" => super::Depth::Shallow,
        "deep" => super::Depth::Deep,
        _ => super::Depth::Medium,
    }
}

fn stage_str(s: Stage) -> &'static str {
    match s {
        Stage::Intake => "intake",
        Stage::Clarify => "clarify",
        Stage::Brief => "brief",
        Stage::Supervise => "supervise",
        Stage::Research => "research",
        Stage::Compress => "compress",
        Stage::Finalise => "finalise",
        Stage::Completed => "completed",
        Stage::Error => "error",
    }
}

fn parse_stage(s: &str) -> Stage {
    match s {
        "clarify" => Stage::Clarify,
        "brief" => Stage::Brief,
        "supervise" => Stage::Supervise,
        "research" => Stage::Research,
        "compress" => Stage::Compress,
        "finalise" => Stage::Finalise,
        "completed" => Stage::Completed,
        "error" => Stage::Error,
        _ => Stage::Intake,
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, spec: SessionSpec) -> Result<Session> {
        let language = spec.language.unwrap_or_else(|| crate::registry::detect(&spec.query));
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let state = ResearchState::new();
        let state_json =
            serde_json::to_string(&state).map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;

        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, query, language, depth, max_researchers, created_at, updated_at, stage, progress, version, state_json, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, NULL)
            "#,
        )
        .bind(&id)
        .bind(&spec.query)
        .bind(language.as_str())
        .bind(depth_str(spec.depth))
        .bind(spec.max_researchers as i64)
        .bind(now)
        .bind(now)
        .bind(stage_str(Stage::Intake))
        .bind(&state_json)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;

        self.load(&id)
            .await?
            .ok_or_else(|| SessionStoreError::Backend {
                message: "session vanished immediately after insert".to_string(),
            })
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;

        match row {
            Some(row) => Self::row_to_session(&row)
                .map(Some)
                .map_err(|message| SessionStoreError::Backend { message }),
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, mutator: Box<super::Mutator>) -> Result<Session> {
        let mut session = self
            .load(id)
            .await?
            .ok_or_else(|| SessionStoreError::NotFound { id: id.to_string() })?;
        let expected_version = session.version;

        mutator(&mut session);
        session.version = expected_version + 1;
        session.updated_at = Utc::now();

        let state_json = serde_json::to_string(&session.state)
            .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;

        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                stage = ?, progress = ?, version = ?, state_json = ?,
                error_message = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(stage_str(session.stage))
        .bind(session.progress as i64)
        .bind(session.version as i64)
        .bind(&state_json)
        .bind(&session.error_message)
        .bind(session.updated_at)
        .bind(id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;

        if result.rows_affected() == 0 {
            let current = self.load(id).await?.ok_or_else(|| SessionStoreError::NotFound {
                id: id.to_string(),
            })?;
            return Err(SessionStoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }

        Ok(session)
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;

        let mut sessions = Vec::new();
        for row in &rows {
            let session = Self::row_to_session(row).map_err(|message| SessionStoreError::Backend { message })?;
            if filter.matches(&session) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Backend { message: e.to_string() })?;
        if result.rows_affected() == 0 {
            return Err(SessionStoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}
