//! Bounded-parallel dispatch of researcher subtasks.
//!
//! Distinct from [`crate::schedulers::Scheduler`] (which gates generic graph
//! nodes by channel version): this scheduler's admission unit is a
//! [`crate::store::Subtask`], its per-slot budget races a `tokio::time::timeout`
//! against a shared cancellation flag, and a panic or error in one slot can
//! never affect another — the same bounded-parallelism idiom
//! (`Semaphore` + `JoinSet`), applied to a different unit of work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::instrument;

use crate::config::SchedulerConfig;
use crate::llm::{LlmGateway, Stage as LlmStage};
use crate::registry::{Language, PromptRegistry, TemplateId};
use crate::search::SearchGateway;
use crate::store::{Subtask, Summary};

/// Outcome of one researcher slot.
#[derive(Debug, Clone)]
pub enum SlotResult {
    Summary(Summary),
    /// A summary produced from a degraded search response (empty or
    /// provider-unconfigured results). Never fatal; the caller still
    /// records a recoverable `SEARCH_DEGRADED` note alongside it.
    DegradedSummary(Summary),
    Error { subtask_ref: usize, kind: SlotErrorKind, message: String },
    Cancelled { subtask_ref: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotErrorKind {
    Timeout,
    LlmUnavailable,
    SearchFailed,
}

/// Lightweight cooperative cancellation signal shared by every slot in a
/// batch and, ultimately, by the owning session.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|c| *c).await;
    }
}

/// Executes batches of research subtasks with bounded parallelism.
pub struct ResearchScheduler {
    llm: Arc<dyn LlmGateway>,
    search: Arc<dyn SearchGateway>,
    registry: Arc<PromptRegistry>,
    config: SchedulerConfig,
    max_results: usize,
}

impl ResearchScheduler {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmGateway>,
        search: Arc<dyn SearchGateway>,
        registry: Arc<PromptRegistry>,
        config: SchedulerConfig,
        max_results: usize,
    ) -> Self {
        Self { llm, search, registry, config, max_results }
    }

    /// Run `subtasks` with at most `concurrency` slots active at once,
    /// returning results in input order. `start_index` is the position of
    /// `subtasks[0]` in the owning session's subtask list, so every
    /// `SlotResult::subtask_ref` names its true origin rather than a
    /// batch-local offset. `cancel_token` cancellation races every in-flight
    /// slot.
    #[instrument(skip(self, subtasks, cancel_token), fields(count = subtasks.len()))]
    pub async fn run_batch(
        &self,
        subtasks: Vec<Subtask>,
        concurrency: usize,
        language: Language,
        start_index: usize,
        cancel_token: CancelToken,
    ) -> Vec<SlotResult> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, subtask) in subtasks.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let llm = self.llm.clone();
            let search = self.search.clone();
            let registry = self.registry.clone();
            let slot_timeout = Duration::from_millis(self.config.slot_timeout_ms);
            let truncation = self.config.content_truncation;
            let max_results = self.max_results;
            let mut cancel = cancel_token.clone();
            let subtask_ref = start_index + idx;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");

                if cancel.is_cancelled() {
                    return (idx, SlotResult::Cancelled { subtask_ref });
                }

                let work = run_one_slot(
                    llm, search, registry, &subtask, subtask_ref, language, truncation, max_results,
                );
                tokio::select! {
                    result = tokio::time::timeout(slot_timeout, work) => {
                        match result {
                            Ok(slot) => (idx, slot),
                            Err(_) => (idx, SlotResult::Error {
                                subtask_ref,
                                kind: SlotErrorKind::Timeout,
                                message: "slot exceeded budget".to_string(),
                            }),
                        }
                    }
                    _ = cancel.cancelled() => (idx, SlotResult::Cancelled { subtask_ref }),
                }
            });
        }

        let mut by_index = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => {
                    by_index.insert(idx, result);
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "researcher slot task panicked");
                }
            }
        }

        (0..by_index.len())
            .filter_map(|i| by_index.remove(&i))
            .collect()
    }
}

async fn run_one_slot(
    llm: Arc<dyn LlmGateway>,
    search: Arc<dyn SearchGateway>,
    registry: Arc<PromptRegistry>,
    subtask: &Subtask,
    subtask_ref: usize,
    language: Language,
    truncation: usize,
    max_results: usize,
) -> SlotResult {
    let outcome = match search.search(&subtask.question, language, max_results).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return SlotResult::Error {
                subtask_ref,
                kind: SlotErrorKind::SearchFailed,
                message: e.to_string(),
            };
        }
    };

    let snippets = outcome
        .results
        .iter()
        .map(|r| {
            let mut snippet = r.snippet.clone();
            snippet.truncate(truncation);
            format!("- {} ({}): {}", r.title, r.url, snippet)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut values = HashMap::new();
    values.insert("question", subtask.question.clone());
    values.insert("snippets", snippets);
    let prompt = match registry.render(TemplateId::Researcher, language, &values) {
        Ok(p) => p,
        Err(e) => {
            return SlotResult::Error {
                subtask_ref,
                kind: SlotErrorKind::LlmUnavailable,
                message: e.to_string(),
            };
        }
    };

    let text = match llm.generate(LlmStage::Research, &prompt, language).await {
        Ok(text) => text,
        Err(e) => {
            return SlotResult::Error {
                subtask_ref,
                kind: SlotErrorKind::LlmUnavailable,
                message: e.to_string(),
            };
        }
    };

    // A degraded search (no provider configured, or a partial provider
    // response) still yields a summary, but one with nothing to cite.
    if outcome.degraded {
        return SlotResult::DegradedSummary(Summary { subtask_ref, text, sources: Vec::new() });
    }

    SlotResult::Summary(Summary {
        subtask_ref,
        text,
        sources: outcome.results.iter().map(|r| r.url.clone()).collect(),
    })
}
