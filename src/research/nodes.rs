//! Stage node implementations for the research workflow graph.
//!
//! Every stage follows the same shape: read [`SessionMeta`]/[`ResearchState`]
//! out of the snapshot's `extra` channel, do the stage's work, mirror the
//! result into the external [`SessionStore`] and [`ProgressBus`], and return
//! the updated documents as the node's `extra` output. A fatal LLM failure is
//! caught and routed to the `error` node via `with_frontier_replace` rather
//! than propagated as `Err(NodeError)`, so one bad generation doesn't abort
//! the whole run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::config::SchedulerConfig;
use crate::llm::{LlmGateway, Stage as LlmStage};
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::registry::{PromptRegistry, TemplateId};
use crate::state::StateSnapshot;
use crate::store::{RecordedError, ResearchState, Session, SessionStore, Stage as SessionStage, Subtask, Summary};
use crate::types::NodeKind;

use super::scheduler::{ResearchScheduler, SlotResult};
use super::{read_meta, read_state, CancelRegistry, SessionMeta, RESEARCH_STATE_KEY};

fn error_route() -> NodeKind {
    NodeKind::Custom("error".to_string())
}

async fn mark_cancelled(
    store: &Arc<dyn SessionStore>,
    progress: &Arc<ProgressBus>,
    session_id: &str,
) -> ResearchState {
    mark_error(store, progress, session_id, "session cancelled".to_string()).await
}

/// Returns the error-routing `NodePartial` if `session_id` has been
/// cancelled, so every stage can bail out with one line before doing its
/// own work.
async fn bail_if_cancelled(
    cancellation: &Arc<CancelRegistry>,
    store: &Arc<dyn SessionStore>,
    progress: &Arc<ProgressBus>,
    session_id: &str,
) -> Option<NodePartial> {
    if !cancellation.is_cancelled(session_id) {
        return None;
    }
    let state = mark_cancelled(store, progress, session_id).await;
    Some(
        NodePartial::new()
            .with_extra(extra_with_state(&state))
            .with_frontier_replace(vec![error_route()]),
    )
}

fn extra_with_state(state: &ResearchState) -> FxHashMap<String, serde_json::Value> {
    let mut extra = FxHashMap::default();
    extra.insert(
        RESEARCH_STATE_KEY.to_string(),
        serde_json::to_value(state).expect("ResearchState serializes"),
    );
    extra
}

async fn touch_store(
    store: &Arc<dyn SessionStore>,
    session_id: &str,
    stage: SessionStage,
    progress: u8,
    state: ResearchState,
) -> Session {
    store
        .update(
            session_id,
            Box::new(move |s: &mut Session| {
                s.stage = stage;
                s.progress = progress;
                s.state = state;
            }),
        )
        .await
        .expect("session created by ResearchEngine::initiate before the graph runs")
}

async fn mark_error(
    store: &Arc<dyn SessionStore>,
    progress: &Arc<ProgressBus>,
    session_id: &str,
    message: String,
) -> ResearchState {
    let session = store
        .update(
            session_id,
            Box::new({
                let message = message.clone();
                move |s: &mut Session| {
                    s.stage = SessionStage::Error;
                    s.error_message = Some(message);
                    s.state.errors.push(RecordedError {
                        stage: s.stage,
                        message: s.error_message.clone().unwrap_or_default(),
                        recoverable: false,
                    });
                }
            }),
        )
        .await
        .expect("session exists");
    progress.publish(ProgressEvent::error(session_id, "error", message));
    session.state
}

fn missing_meta() -> NodeError {
    NodeError::MissingInput { what: "session_meta" }
}

/// Progress percentage for the supervise/research loop, which occupies the
/// 25..=60 band. `iteration` completed out of `max_iterations` maps linearly
/// into that band so successive supervise/research events never regress,
/// regardless of how many loop cycles a session runs.
fn loop_progress(iteration: u32, max_iterations: u32) -> u8 {
    25 + (iteration.min(max_iterations) * 35 / max_iterations.max(1)) as u8
}

pub struct IntakeNode {
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
    pub cancellation: Arc<CancelRegistry>,
}

#[async_trait]
impl Node for IntakeNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let meta = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let state = read_state(&snapshot.extra);

        if let Some(partial) =
            bail_if_cancelled(&self.cancellation, &self.store, &self.progress, &meta.session_id).await
        {
            return Ok(partial);
        }

        touch_store(&self.store, &meta.session_id, SessionStage::Intake, 5, state.clone()).await;
        self.progress.publish(ProgressEvent::update(&meta.session_id, "intake", 5));

        Ok(NodePartial::new().with_extra(extra_with_state(&state)))
    }
}

pub struct ClarifyNode {
    pub llm: Arc<dyn LlmGateway>,
    pub registry: Arc<PromptRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
    pub cancellation: Arc<CancelRegistry>,
}

#[async_trait]
impl Node for ClarifyNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let meta = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let mut state = read_state(&snapshot.extra);

        if let Some(partial) =
            bail_if_cancelled(&self.cancellation, &self.store, &self.progress, &meta.session_id).await
        {
            return Ok(partial);
        }

        let session = self.store.load(&meta.session_id).await.ok().flatten();
        let question = session.map(|s| s.query).unwrap_or_default();
        let mut values = HashMap::new();
        values.insert("question", question);

        let prompt = match self.registry.render(TemplateId::Clarification, meta.language, &values) {
            Ok(p) => p,
            Err(e) => {
                state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                return Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]));
            }
        };

        self.progress.publish(ProgressEvent::thinking(&meta.session_id, "clarify", 10));
        match self.llm.generate(LlmStage::Research, &prompt, meta.language).await {
            Ok(goal) => {
                state.clarified_goal = Some(goal);
                touch_store(&self.store, &meta.session_id, SessionStage::Clarify, 15, state.clone()).await;
                self.progress.publish(ProgressEvent::update(&meta.session_id, "clarify", 15));
                Ok(NodePartial::new().with_extra(extra_with_state(&state)))
            }
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]))
            }
        }
    }
}

pub struct BriefNode {
    pub llm: Arc<dyn LlmGateway>,
    pub registry: Arc<PromptRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
    pub cancellation: Arc<CancelRegistry>,
}

#[async_trait]
impl Node for BriefNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let meta = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let mut state = read_state(&snapshot.extra);

        if let Some(partial) =
            bail_if_cancelled(&self.cancellation, &self.store, &self.progress, &meta.session_id).await
        {
            return Ok(partial);
        }

        let session = self.store.load(&meta.session_id).await.ok().flatten();
        let question = session.map(|s| s.query).unwrap_or_default();

        let mut values = HashMap::new();
        values.insert("question", question);
        values.insert("clarified_goal", state.clarified_goal.clone().unwrap_or_default());

        let prompt = match self.registry.render(TemplateId::ResearchBrief, meta.language, &values) {
            Ok(p) => p,
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                return Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]));
            }
        };

        self.progress.publish(ProgressEvent::thinking(&meta.session_id, "brief", 20));
        match self.llm.generate(LlmStage::Research, &prompt, meta.language).await {
            Ok(brief) => {
                state.brief = Some(brief);
                touch_store(&self.store, &meta.session_id, SessionStage::Brief, 25, state.clone()).await;
                self.progress.publish(ProgressEvent::update(&meta.session_id, "brief", 25));
                Ok(NodePartial::new().with_extra(extra_with_state(&state)))
            }
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]))
            }
        }
    }
}

/// Decides, per iteration, whether to dispatch another batch of researcher
/// subtasks or move on to compression. Routing is data-dependent (iteration
/// count, whether the supervisor proposed any new subtasks) so it is
/// expressed as a frontier replace rather than a static/conditional edge.
pub struct SuperviseNode {
    pub llm: Arc<dyn LlmGateway>,
    pub registry: Arc<PromptRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
    pub cancellation: Arc<CancelRegistry>,
    pub scheduler_config: SchedulerConfig,
}

#[async_trait]
impl Node for SuperviseNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let meta = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let mut state = read_state(&snapshot.extra);

        if let Some(partial) =
            bail_if_cancelled(&self.cancellation, &self.store, &self.progress, &meta.session_id).await
        {
            return Ok(partial);
        }

        let max_iterations = self.scheduler_config.max_iterations(meta.depth);
        if state.iteration >= max_iterations {
            let pct = loop_progress(max_iterations, max_iterations);
            touch_store(&self.store, &meta.session_id, SessionStage::Compress, pct, state.clone()).await;
            self.progress.publish(ProgressEvent::update(&meta.session_id, "supervise", pct));
            return Ok(NodePartial::new()
                .with_extra(extra_with_state(&state))
                .with_frontier_replace(vec![NodeKind::Custom("compress".to_string())]));
        }

        let summaries_text = state
            .summaries
            .iter()
            .map(|s| format!("- {}", s.text))
            .collect::<Vec<_>>()
            .join("\n");
        let mut values = HashMap::new();
        values.insert("brief", state.brief.clone().unwrap_or_default());
        values.insert("summaries", summaries_text);
        values.insert("iteration", state.iteration.to_string());

        let prompt = match self.registry.render(TemplateId::Supervisor, meta.language, &values) {
            Ok(p) => p,
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                return Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]));
            }
        };

        self.progress.publish(ProgressEvent::thinking(
            &meta.session_id,
            "supervise",
            loop_progress(state.iteration, max_iterations),
        ));
        let proposal = match self.llm.generate(LlmStage::Research, &prompt, meta.language).await {
            Ok(text) => text,
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                return Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]));
            }
        };

        let proposed: Vec<Subtask> = proposal
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(meta.max_researchers)
            .map(|line| Subtask {
                question: line
                    .trim_start_matches(|c: char| c == '-' || c == '*' || c == ' ')
                    .to_string(),
                description: String::new(),
            })
            .collect();

        state.iteration += 1;

        if proposed.is_empty() {
            let pct = loop_progress(max_iterations, max_iterations);
            touch_store(&self.store, &meta.session_id, SessionStage::Compress, pct, state.clone()).await;
            self.progress.publish(ProgressEvent::update(&meta.session_id, "supervise", pct));
            return Ok(NodePartial::new()
                .with_extra(extra_with_state(&state))
                .with_frontier_replace(vec![NodeKind::Custom("compress".to_string())]));
        }

        // Collapse subtasks the supervisor already proposed in a prior
        // iteration. If every proposal this round is a duplicate, the
        // supervisor is stuck repeating itself rather than genuinely
        // declaring the brief covered: that is NO_PROGRESS, not a clean
        // hand-off to compress.
        let new_subtasks: Vec<Subtask> = proposed
            .into_iter()
            .filter(|candidate| {
                !state
                    .subtasks
                    .iter()
                    .any(|existing| existing.question.eq_ignore_ascii_case(&candidate.question))
            })
            .collect();

        if new_subtasks.is_empty() {
            let state = mark_error(
                &self.store,
                &self.progress,
                &meta.session_id,
                "supervisor made no progress: every proposed subtask duplicates one already seen"
                    .to_string(),
            )
            .await;
            return Ok(NodePartial::new()
                .with_extra(extra_with_state(&state))
                .with_frontier_replace(vec![error_route()]));
        }

        state.subtasks.extend(new_subtasks);
        let progress_pct = loop_progress(state.iteration, max_iterations);
        touch_store(&self.store, &meta.session_id, SessionStage::Supervise, progress_pct, state.clone()).await;
        self.progress.publish(ProgressEvent::update(&meta.session_id, "supervise", progress_pct));

        Ok(NodePartial::new()
            .with_extra(extra_with_state(&state))
            .with_frontier_replace(vec![NodeKind::Custom("research".to_string())]))
    }
}

pub struct ResearchNode {
    pub scheduler: Arc<ResearchScheduler>,
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
    pub cancellation: Arc<CancelRegistry>,
    pub scheduler_config: SchedulerConfig,
}

#[async_trait]
impl Node for ResearchNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let meta = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let mut state = read_state(&snapshot.extra);

        if let Some(partial) =
            bail_if_cancelled(&self.cancellation, &self.store, &self.progress, &meta.session_id).await
        {
            return Ok(partial);
        }

        let start_index = state.summaries.len();
        let pending: Vec<Subtask> = state.subtasks[start_index..].to_vec();
        let token = self.cancellation.token_for(&meta.session_id);
        let concurrency = meta.max_researchers.max(1);
        let max_iterations = self.scheduler_config.max_iterations(meta.depth);

        self.progress.publish(ProgressEvent::searching(
            &meta.session_id,
            "research",
            loop_progress(state.iteration, max_iterations),
        ));
        let results = self
            .scheduler
            .run_batch(pending, concurrency, meta.language, start_index, token)
            .await;

        // Every outcome but Cancelled advances `summaries.len()` by one, even
        // a failed slot (with an empty placeholder summary) — a subtask is
        // never redispatched once its slot has run.
        let any_cancelled = results.iter().any(|r| matches!(r, SlotResult::Cancelled { .. }));
        for result in results {
            match result {
                SlotResult::Summary(summary) => state.summaries.push(summary),
                SlotResult::DegradedSummary(summary) => {
                    state.errors.push(RecordedError {
                        stage: SessionStage::Research,
                        message: "SEARCH_DEGRADED: no results from the configured search provider"
                            .to_string(),
                        recoverable: true,
                    });
                    state.summaries.push(summary);
                }
                SlotResult::Error { subtask_ref, message, .. } => {
                    state.errors.push(RecordedError {
                        stage: SessionStage::Research,
                        message,
                        recoverable: true,
                    });
                    state.summaries.push(Summary { subtask_ref, text: String::new(), sources: Vec::new() });
                }
                SlotResult::Cancelled { .. } => {}
            }
        }

        if any_cancelled {
            let state = mark_cancelled(&self.store, &self.progress, &meta.session_id).await;
            return Ok(NodePartial::new()
                .with_extra(extra_with_state(&state))
                .with_frontier_replace(vec![error_route()]));
        }

        let progress_pct = loop_progress(state.iteration, max_iterations);
        touch_store(&self.store, &meta.session_id, SessionStage::Research, progress_pct, state.clone()).await;
        self.progress.publish(ProgressEvent::update(&meta.session_id, "research", progress_pct));

        Ok(NodePartial::new()
            .with_extra(extra_with_state(&state))
            .with_frontier_replace(vec![NodeKind::Custom("supervise".to_string())]))
    }
}

pub struct CompressNode {
    pub llm: Arc<dyn LlmGateway>,
    pub registry: Arc<PromptRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
    pub cancellation: Arc<CancelRegistry>,
}

#[async_trait]
impl Node for CompressNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let meta = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let mut state = read_state(&snapshot.extra);

        if let Some(partial) =
            bail_if_cancelled(&self.cancellation, &self.store, &self.progress, &meta.session_id).await
        {
            return Ok(partial);
        }

        let summaries_text = state
            .summaries
            .iter()
            .map(|s| format!("- {} (sources: {})", s.text, s.sources.join(", ")))
            .collect::<Vec<_>>()
            .join("\n");
        let mut values = HashMap::new();
        values.insert("summaries", summaries_text);

        let prompt = match self.registry.render(TemplateId::Compression, meta.language, &values) {
            Ok(p) => p,
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                return Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]));
            }
        };

        self.progress.publish(ProgressEvent::thinking(&meta.session_id, "compress", 65));
        match self.llm.generate(LlmStage::Compression, &prompt, meta.language).await {
            Ok(compressed) => {
                state.compressed = Some(compressed);
                touch_store(&self.store, &meta.session_id, SessionStage::Compress, 75, state.clone()).await;
                self.progress.publish(ProgressEvent::update(&meta.session_id, "compress", 75));
                Ok(NodePartial::new().with_extra(extra_with_state(&state)))
            }
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]))
            }
        }
    }
}

pub struct FinaliseNode {
    pub llm: Arc<dyn LlmGateway>,
    pub registry: Arc<PromptRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
    pub cancellation: Arc<CancelRegistry>,
}

#[async_trait]
impl Node for FinaliseNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let meta = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let mut state = read_state(&snapshot.extra);

        if let Some(partial) =
            bail_if_cancelled(&self.cancellation, &self.store, &self.progress, &meta.session_id).await
        {
            return Ok(partial);
        }

        let mut values = HashMap::new();
        values.insert("brief", state.brief.clone().unwrap_or_default());
        values.insert("compressed", state.compressed.clone().unwrap_or_default());

        let prompt = match self.registry.render(TemplateId::FinalReport, meta.language, &values) {
            Ok(p) => p,
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                return Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]));
            }
        };

        self.progress.publish(ProgressEvent::thinking(&meta.session_id, "finalise", 85));
        match self.llm.generate(LlmStage::FinalReport, &prompt, meta.language).await {
            Ok(report) => {
                state.final_report = Some(report);
                touch_store(&self.store, &meta.session_id, SessionStage::Completed, 100, state.clone()).await;
                self.progress.publish(ProgressEvent::complete(&meta.session_id));
                Ok(NodePartial::new().with_extra(extra_with_state(&state)))
            }
            Err(e) => {
                let state = mark_error(&self.store, &self.progress, &meta.session_id, e.to_string()).await;
                Ok(NodePartial::new()
                    .with_extra(extra_with_state(&state))
                    .with_frontier_replace(vec![error_route()]))
            }
        }
    }
}

/// Terminal sink for any fatal failure; the session's `error_message` and
/// `stage` were already set by the failing node's call to `mark_error`.
pub struct ErrorNode {
    pub store: Arc<dyn SessionStore>,
    pub progress: Arc<ProgressBus>,
}

#[async_trait]
impl Node for ErrorNode {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let _ = read_meta(&snapshot.extra).ok_or_else(missing_meta)?;
        let state = read_state(&snapshot.extra);
        let _ = (&self.store, &self.progress);
        Ok(NodePartial::new().with_extra(extra_with_state(&state)))
    }
}
