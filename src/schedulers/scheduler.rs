use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::event_bus::EventEmitter;
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::state::StateSnapshot;
use crate::types::NodeKind;

/// Per-node record of the last channel versions a node has reacted to.
///
/// Keyed by `NodeKind::encode()`. The inner map tracks `"messages"` and
/// `"extra"` versions independently so a node only reruns when a channel it
/// cares about actually changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub versions_seen: FxHashMap<String, FxHashMap<String, u64>>,
}

/// Bounds how many frontier nodes run concurrently within a superstep.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub concurrency_limit: usize,
}

/// Outcome of one [`Scheduler::superstep`] call.
#[derive(Debug, Clone)]
pub struct StepRunResult {
    /// Nodes that actually executed this step, in frontier order.
    pub ran_nodes: Vec<NodeKind>,
    /// Nodes skipped because they were End or version-gated out.
    pub skipped_nodes: Vec<NodeKind>,
    /// Outputs produced by the nodes that ran. Order is not guaranteed to
    /// match `ran_nodes` — callers that need alignment should index by
    /// `NodeKind`.
    pub outputs: Vec<(NodeKind, NodePartial)>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("node {kind:?} failed at step {step}: {source}")]
    #[diagnostic(code(deepresearch::schedulers::node_run))]
    NodeRun {
        kind: NodeKind,
        step: u64,
        #[source]
        source: NodeError,
    },

    #[error("scheduler task join error: {0}")]
    #[diagnostic(code(deepresearch::schedulers::join))]
    Join(#[from] tokio::task::JoinError),
}

const MESSAGES_KEY: &str = "messages";
const EXTRA_KEY: &str = "extra";

impl Scheduler {
    /// Create a scheduler that runs at most `concurrency_limit` nodes at once.
    #[must_use]
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    /// Returns `true` if `id` has not yet observed the channel versions in
    /// `snapshot` (i.e. it needs to run).
    #[must_use]
    pub fn should_run(&self, state: &SchedulerState, id: &str, snapshot: &StateSnapshot) -> bool {
        match state.versions_seen.get(id) {
            None => true,
            Some(seen) => {
                let msgs_seen = seen.get(MESSAGES_KEY).copied().unwrap_or(0);
                let extra_seen = seen.get(EXTRA_KEY).copied().unwrap_or(0);
                u64::from(snapshot.messages_version) != msgs_seen
                    || u64::from(snapshot.extra_version) != extra_seen
            }
        }
    }

    /// Record that `id` has observed the channel versions in `snapshot`.
    pub fn record_seen(&self, state: &mut SchedulerState, id: &str, snapshot: &StateSnapshot) {
        let entry = state.versions_seen.entry(id.to_string()).or_default();
        entry.insert(MESSAGES_KEY.to_string(), u64::from(snapshot.messages_version));
        entry.insert(EXTRA_KEY.to_string(), u64::from(snapshot.extra_version));
    }

    /// Run one superstep: gate the frontier against previously-seen versions,
    /// execute the surviving nodes concurrently (bounded by
    /// `concurrency_limit`), and report what ran, what was skipped, and the
    /// resulting partial updates.
    #[instrument(skip(self, state, nodes, frontier, snapshot, emitter))]
    pub async fn superstep(
        &self,
        state: &mut SchedulerState,
        nodes: &FxHashMap<NodeKind, Arc<dyn Node>>,
        frontier: Vec<NodeKind>,
        snapshot: StateSnapshot,
        step: u64,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<StepRunResult, SchedulerError> {
        let mut skipped_nodes = Vec::new();
        let mut scheduled = Vec::new();

        for kind in frontier {
            if kind.is_end() {
                skipped_nodes.push(kind);
                continue;
            }
            let id = kind.encode();
            if self.should_run(state, &id, &snapshot) {
                scheduled.push(kind);
            } else {
                skipped_nodes.push(kind);
            }
        }

        if scheduled.is_empty() {
            return Ok(StepRunResult {
                ran_nodes: Vec::new(),
                skipped_nodes,
                outputs: Vec::new(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut join_set = JoinSet::new();

        for kind in scheduled.iter().cloned() {
            let node = nodes
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| panic!("scheduled node {kind:?} missing from registry"));
            let snapshot = snapshot.clone();
            let emitter = emitter.clone();
            let semaphore = semaphore.clone();
            let node_id = kind.encode();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("scheduler semaphore closed unexpectedly");
                let ctx = NodeContext {
                    node_id,
                    step,
                    event_emitter: emitter,
                };
                let result = node.run(snapshot, ctx).await;
                (kind, result)
            });
        }

        let mut outputs_by_kind: FxHashMap<NodeKind, NodePartial> = FxHashMap::default();
        while let Some(joined) = join_set.join_next().await {
            let (kind, result) = joined?;
            match result {
                Ok(partial) => {
                    outputs_by_kind.insert(kind, partial);
                }
                Err(source) => {
                    // Drop remaining in-flight tasks; the step as a whole failed.
                    join_set.abort_all();
                    return Err(SchedulerError::NodeRun { kind, step, source });
                }
            }
        }

        let mut ran_nodes = Vec::with_capacity(scheduled.len());
        for kind in &scheduled {
            let id = kind.encode();
            self.record_seen(state, &id, &snapshot);
            ran_nodes.push(kind.clone());
        }

        let outputs: Vec<(NodeKind, NodePartial)> = ran_nodes
            .iter()
            .cloned()
            .filter_map(|kind| outputs_by_kind.remove(&kind).map(|partial| (kind, partial)))
            .collect();

        Ok(StepRunResult {
            ran_nodes,
            skipped_nodes,
            outputs,
        })
    }
}
