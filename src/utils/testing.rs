//! Shared fixtures for exercising the scheduler and barrier without pulling
//! in a full graph/runner setup. Used by unit tests in this crate and by the
//! scheduler integration tests under `tests/`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::state::StateSnapshot;
use crate::types::NodeKind;

/// Build a [`StateSnapshot`] with the given channel versions and no content.
pub fn create_test_snapshot(messages_version: u32, extra_version: u32) -> StateSnapshot {
    StateSnapshot {
        messages: Vec::new(),
        messages_version,
        extra: FxHashMap::default(),
        extra_version,
        errors: Vec::new(),
        errors_version: 1,
    }
}

/// A node that emits one assistant message naming itself, with no delay.
pub struct EchoNode {
    pub label: &'static str,
}

#[async_trait]
impl Node for EchoNode {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        _ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        Ok(NodePartial::new().with_messages(vec![Message::assistant(self.label)]))
    }
}

/// Same as [`EchoNode`] but sleeps briefly before returning, so tests can
/// observe concurrent vs. serialized scheduling.
pub struct DelayedEchoNode {
    pub label: &'static str,
    pub delay: Duration,
}

#[async_trait]
impl Node for DelayedEchoNode {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        _ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        tokio::time::sleep(self.delay).await;
        Ok(NodePartial::new().with_messages(vec![Message::assistant(self.label)]))
    }
}

/// A node that always fails with a fixed `MissingInput` error.
#[derive(Default)]
pub struct FailingNode;

#[async_trait]
impl Node for FailingNode {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        _ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        Err(NodeError::MissingInput {
            what: "test_key",
        })
    }
}

/// Registry with two immediately-returning nodes, "A" and "B".
pub fn make_test_registry() -> FxHashMap<NodeKind, Arc<dyn Node>> {
    let mut nodes: FxHashMap<NodeKind, Arc<dyn Node>> = FxHashMap::default();
    nodes.insert(
        NodeKind::Custom("A".into()),
        Arc::new(EchoNode { label: "A" }),
    );
    nodes.insert(
        NodeKind::Custom("B".into()),
        Arc::new(EchoNode { label: "B" }),
    );
    nodes
}

/// Registry with two nodes, "A" and "B", that each sleep briefly before
/// returning — useful for asserting concurrency/order-independence.
pub fn make_delayed_registry() -> FxHashMap<NodeKind, Arc<dyn Node>> {
    let mut nodes: FxHashMap<NodeKind, Arc<dyn Node>> = FxHashMap::default();
    nodes.insert(
        NodeKind::Custom("A".into()),
        Arc::new(DelayedEchoNode {
            label: "A",
            delay: Duration::from_millis(10),
        }),
    );
    nodes.insert(
        NodeKind::Custom("B".into()),
        Arc::new(DelayedEchoNode {
            label: "B",
            delay: Duration::from_millis(1),
        }),
    );
    nodes
}
