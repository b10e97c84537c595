//! The research workflow state machine: intake, clarify, brief, supervise,
//! research, compress, finalise.
//!
//! Each stage is one [`crate::node::Node`] compiled into a graph via
//! [`crate::graphs::GraphBuilder`]; the state machine's two data-dependent
//! branches (Supervise's research-vs-compress decision, and any fatal
//! failure routing to Error) are expressed with
//! [`crate::node::NodePartial::with_frontier_replace`] rather than
//! conditional edges, since the decision depends on fields the stage node
//! computes during its own execution rather than a pure function of the
//! snapshot alone.

pub mod nodes;
pub mod scheduler;

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::app::App;
use crate::config::EngineConfig;
use crate::graphs::GraphBuilder;
use crate::llm::{HttpLlmGateway, LlmGateway};
use crate::progress::ProgressBus;
use crate::registry::{Language, PromptRegistry};
use crate::runtimes::{AppRunner, CheckpointerType};
use crate::search::{HttpSearchGateway, SearchGateway};
use crate::store::{
    Depth, InMemorySessionStore, ResearchState, Session, SessionFilter, SessionSpec, SessionStore,
};
use crate::types::NodeKind;

pub use scheduler::{CancelHandle, CancelToken, ResearchScheduler, SlotErrorKind, SlotResult};

/// User-visible error taxonomy (§7 of the originating design), carried by
/// [`EngineError`] rather than reinvented per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    LlmUnavailable,
    SearchDegraded,
    Timeout,
    NoProgress,
    Cancelled,
    Internal,
}

#[derive(Debug, Error, Diagnostic)]
#[error("{kind:?}: {message}")]
#[diagnostic(code(deepresearch::engine::error))]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<crate::store::SessionStoreError> for EngineError {
    fn from(e: crate::store::SessionStoreError) -> Self {
        match e {
            crate::store::SessionStoreError::NotFound { id } => {
                EngineError::new(ErrorKind::NotFound, format!("session not found: {id}"))
            }
            other => EngineError::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

impl From<crate::runtimes::RunnerError> for EngineError {
    fn from(e: crate::runtimes::RunnerError) -> Self {
        EngineError::new(ErrorKind::Internal, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Metadata stashed in the graph's `extra` channel so stage nodes can reach
/// the owning session without the Workflow Engine threading extra
/// parameters through every `Node::run` call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub language: Language,
    pub depth: Depth,
    pub max_researchers: usize,
}

pub const SESSION_META_KEY: &str = "session_meta";
pub const RESEARCH_STATE_KEY: &str = "research_state";

/// Per-session cancellation signal shared by every stage node and the
/// Scheduler running that session's researcher batch. Lazily seeded by
/// [`ResearchEngine::initiate`] so a `cancel` landing before any node has
/// run still takes effect once the graph starts.
#[derive(Default)]
pub(crate) struct CancelRegistry {
    tokens: parking_lot::Mutex<std::collections::HashMap<String, (CancelHandle, CancelToken)>>,
}

impl CancelRegistry {
    pub(crate) fn token_for(&self, session_id: &str) -> CancelToken {
        self.tokens
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(scheduler::cancel_pair)
            .1
            .clone()
    }

    pub(crate) fn is_cancelled(&self, session_id: &str) -> bool {
        self.tokens
            .lock()
            .get(session_id)
            .map(|(_, token)| token.is_cancelled())
            .unwrap_or(false)
    }

    pub(crate) fn cancel(&self, session_id: &str) {
        if let Some((handle, _)) = self.tokens.lock().get(session_id) {
            handle.cancel();
        }
    }

    pub(crate) fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }
}

/// Final report returned once a session reaches `Completed`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Report {
    pub session_id: String,
    pub research_question: String,
    pub language: Language,
    pub report: String,
    pub sources: Vec<Vec<String>>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub llm_available: bool,
    pub search_available: bool,
}

fn node_kind(name: &str) -> NodeKind {
    NodeKind::Custom(name.to_string())
}

/// Wires the Workflow Engine's stage nodes onto the graph substrate and
/// drives sessions end to end: LLM/Search gateways, prompt registry,
/// session store, progress bus, and the researcher scheduler.
pub struct ResearchEngine {
    runner: Mutex<AppRunner>,
    store: Arc<dyn SessionStore>,
    progress: Arc<ProgressBus>,
    cancellation: Arc<CancelRegistry>,
    llm: Arc<dyn LlmGateway>,
    search: Arc<dyn SearchGateway>,
    config: EngineConfig,
}

impl ResearchEngine {
    pub async fn new(config: EngineConfig) -> Self {
        let llm: Arc<dyn LlmGateway> = Arc::new(HttpLlmGateway::new(&config.llm));
        let search: Arc<dyn SearchGateway> = Arc::new(HttpSearchGateway::new(&config.search));
        let registry = Arc::new(PromptRegistry::new().expect("built-in templates must validate"));
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let progress = Arc::new(ProgressBus::new());
        let cancellation = Arc::new(CancelRegistry::default());
        let scheduler = Arc::new(ResearchScheduler::new(
            llm.clone(),
            search.clone(),
            registry.clone(),
            config.scheduler.clone(),
            config.search.max_results,
        ));

        let app = Self::build_app(
            llm.clone(),
            registry,
            store.clone(),
            progress.clone(),
            cancellation.clone(),
            scheduler,
            config.scheduler.clone(),
        );
        let runner = AppRunner::new(app, CheckpointerType::InMemory).await;

        Self {
            runner: Mutex::new(runner),
            store,
            progress,
            cancellation,
            llm,
            search,
            config,
        }
    }

    fn build_app(
        llm: Arc<dyn LlmGateway>,
        registry: Arc<PromptRegistry>,
        store: Arc<dyn SessionStore>,
        progress: Arc<ProgressBus>,
        cancellation: Arc<CancelRegistry>,
        scheduler: Arc<ResearchScheduler>,
        scheduler_config: crate::config::SchedulerConfig,
    ) -> App {
        use nodes::*;

        GraphBuilder::new()
            .add_node(
                node_kind("intake"),
                IntakeNode { store: store.clone(), progress: progress.clone(), cancellation: cancellation.clone() },
            )
            .add_node(
                node_kind("clarify"),
                ClarifyNode {
                    llm: llm.clone(),
                    registry: registry.clone(),
                    store: store.clone(),
                    progress: progress.clone(),
                    cancellation: cancellation.clone(),
                },
            )
            .add_node(
                node_kind("brief"),
                BriefNode {
                    llm: llm.clone(),
                    registry: registry.clone(),
                    store: store.clone(),
                    progress: progress.clone(),
                    cancellation: cancellation.clone(),
                },
            )
            .add_node(
                node_kind("supervise"),
                SuperviseNode {
                    llm: llm.clone(),
                    registry: registry.clone(),
                    store: store.clone(),
                    progress: progress.clone(),
                    cancellation: cancellation.clone(),
                    scheduler_config: scheduler_config.clone(),
                },
            )
            .add_node(
                node_kind("research"),
                ResearchNode {
                    scheduler,
                    store: store.clone(),
                    progress: progress.clone(),
                    cancellation: cancellation.clone(),
                    scheduler_config,
                },
            )
            .add_node(
                node_kind("compress"),
                CompressNode {
                    llm: llm.clone(),
                    registry: registry.clone(),
                    store: store.clone(),
                    progress: progress.clone(),
                    cancellation: cancellation.clone(),
                },
            )
            .add_node(
                node_kind("finalise"),
                FinaliseNode { llm, registry, store: store.clone(), progress: progress.clone(), cancellation },
            )
            .add_node(node_kind("error"), ErrorNode { store, progress })
            .add_edge(NodeKind::Start, node_kind("intake"))
            .add_edge(node_kind("intake"), node_kind("clarify"))
            .add_edge(node_kind("clarify"), node_kind("brief"))
            .add_edge(node_kind("brief"), node_kind("supervise"))
            .add_edge(node_kind("research"), node_kind("supervise"))
            .add_edge(node_kind("compress"), node_kind("finalise"))
            .add_edge(node_kind("finalise"), NodeKind::End)
            .add_edge(node_kind("error"), NodeKind::End)
            .compile()
    }

    /// Create a new session and run it to completion (or to a fatal error),
    /// publishing progress events as stages complete. Returns the session's
    /// id immediately after the initial state is set up; callers await
    /// [`ResearchEngine::run`] (or poll [`ResearchEngine::status`]) to
    /// observe progress.
    pub async fn initiate(
        &self,
        query: String,
        language: Option<Language>,
        depth: Depth,
        max_researchers: usize,
    ) -> Result<Session> {
        if query.trim().is_empty() || query.len() > 1000 {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                "query must be 1..=1000 characters",
            ));
        }
        let max_researchers = max_researchers.clamp(1, 5);

        let session = self
            .store
            .create(SessionSpec { query, language, depth, max_researchers })
            .await?;

        let meta = SessionMeta {
            session_id: session.id.clone(),
            language: session.language,
            depth: session.depth,
            max_researchers: session.max_researchers,
        };
        let mut initial = crate::state::VersionedState::new_with_user_message(&session.query);
        initial.add_extra(
            SESSION_META_KEY,
            serde_json::to_value(&meta).expect("SessionMeta serializes"),
        );
        initial.add_extra(
            RESEARCH_STATE_KEY,
            serde_json::to_value(ResearchState::new()).expect("ResearchState serializes"),
        );

        // Seed the cancellation entry now so a `cancel` arriving before the
        // graph's first tick still lands on the token every stage node reads.
        self.cancellation.token_for(&session.id);

        let mut runner = self.runner.lock().await;
        runner.create_session(session.id.clone(), initial).await?;

        Ok(session)
    }

    /// Cooperatively cancel a session. The running (or next-to-run) stage
    /// node observes the signal and routes to the error stage with a
    /// `cancelled` message; in-flight researcher slots report `Cancelled`.
    /// Idempotent: a second call after the first changes no observable
    /// state.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.status(session_id).await?;
        self.cancellation.cancel(session_id);
        Ok(())
    }

    /// Drive a previously-[`initiate`](Self::initiate)d session to
    /// completion. Intended to run on a spawned task so the caller can poll
    /// [`ResearchEngine::status`] / subscribe to progress concurrently.
    pub async fn run(&self, session_id: &str) -> Result<()> {
        let mut runner = self.runner.lock().await;
        runner.run_until_complete(session_id).await?;
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Result<Session> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| EngineError::new(ErrorKind::NotFound, format!("session not found: {session_id}")))
    }

    pub async fn report(&self, session_id: &str) -> Result<Report> {
        let session = self.status(session_id).await?;
        if session.stage != crate::store::Stage::Completed {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                "report is only available once the session has completed",
            ));
        }
        let report = session.state.final_report.clone().ok_or_else(|| {
            EngineError::new(ErrorKind::Internal, "completed session missing final_report")
        })?;
        let sources = session.state.summaries.iter().map(|s| s.sources.clone()).collect();

        Ok(Report {
            session_id: session.id,
            research_question: session.query,
            language: session.language,
            report,
            sources,
            generated_at: session.updated_at,
        })
    }

    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.progress.close(session_id);
        self.cancellation.remove(session_id);
        Ok(self.store.delete(session_id).await?)
    }

    pub fn subscribe(&self, session_id: &str) -> crate::progress::Subscription {
        self.progress.subscribe(session_id)
    }

    /// Probes the configured LLM and search backends directly rather than
    /// trusting presence of config alone; each probe is bounded so a hung
    /// backend can't stall the health check.
    pub async fn health(&self) -> HealthStatus {
        let (llm_available, search_available) =
            tokio::join!(self.llm.probe(), self.search.probe());
        HealthStatus { status: "ok", llm_available, search_available }
    }
}

pub(crate) fn read_meta(extra: &rustc_hash::FxHashMap<String, serde_json::Value>) -> Option<SessionMeta> {
    extra.get(SESSION_META_KEY).and_then(|v| serde_json::from_value(v.clone()).ok())
}

pub(crate) fn read_state(extra: &rustc_hash::FxHashMap<String, serde_json::Value>) -> ResearchState {
    extra
        .get(RESEARCH_STATE_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            llm: crate::config::LlmConfig {
                local_endpoint: None,
                openai_endpoint: None,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn initiate_rejects_empty_query() {
        let engine = ResearchEngine::new(test_config()).await;
        let err = engine
            .initiate(String::new(), None, Depth::Shallow, 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn initiate_creates_a_session_in_intake_stage() {
        let engine = ResearchEngine::new(test_config()).await;
        let session = engine
            .initiate("latest trends in quantum computing".to_string(), None, Depth::Shallow, 2)
            .await
            .unwrap();
        assert_eq!(session.stage, crate::store::Stage::Intake);

        let fetched = engine.status(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
    }

    #[tokio::test]
    async fn run_without_llm_provider_ends_in_error_stage() {
        let engine = ResearchEngine::new(test_config()).await;
        let session = engine
            .initiate("why is the sky blue".to_string(), None, Depth::Shallow, 1)
            .await
            .unwrap();
        engine.run(&session.id).await.unwrap();

        let finished = engine.status(&session.id).await.unwrap();
        assert_eq!(finished.stage, crate::store::Stage::Error);
        assert!(finished.error_message.is_some());
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_not_found() {
        let engine = ResearchEngine::new(test_config()).await;
        let err = engine.cancel("missing").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cancel_before_run_routes_the_session_to_error() {
        let engine = ResearchEngine::new(test_config()).await;
        let session = engine
            .initiate("why is the sky blue".to_string(), None, Depth::Shallow, 1)
            .await
            .unwrap();

        engine.cancel(&session.id).await.unwrap();
        // Idempotent: a second cancel changes nothing observable.
        engine.cancel(&session.id).await.unwrap();

        engine.run(&session.id).await.unwrap();

        let finished = engine.status(&session.id).await.unwrap();
        assert_eq!(finished.stage, crate::store::Stage::Error);
        assert!(finished.error_message.unwrap().contains("cancelled"));
    }
}
