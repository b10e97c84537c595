//! Edge types and routing predicates for conditional graph flow.
//!
//! This module contains the types and predicates used for dynamic routing
//! in workflow graphs, including conditional edges that can route based
//! on runtime state evaluation.

use crate::types::NodeKind;
use std::sync::Arc;

/// Predicate function for conditional edge routing.
///
/// Takes a [`StateSnapshot`](crate::state::StateSnapshot) and returns target
/// node names to determine which nodes should be executed next. Predicates
/// are used with [`GraphBuilder::add_conditional_edge`](super::GraphBuilder::add_conditional_edge)
/// to create dynamic routing based on the current state.
///
/// # Examples
///
/// ```
/// use deepresearch::graphs::EdgePredicate;
/// use std::sync::Arc;
///
/// let route_by_messages: EdgePredicate = Arc::new(|snapshot| {
///     if snapshot.messages.len() > 5 {
///         vec!["many_messages".to_string()]
///     } else {
///         vec!["few_messages".to_string()]
///     }
/// });
/// ```
pub type EdgePredicate =
    Arc<dyn Fn(crate::state::StateSnapshot) -> Vec<String> + Send + Sync + 'static>;

/// A conditional edge that routes based on a predicate function.
///
/// Conditional edges allow dynamic routing in workflows based on the current
/// state. When the scheduler encounters a conditional edge, it evaluates the
/// predicate function and routes to the returned target nodes.
///
/// # Examples
///
/// ```
/// use deepresearch::graphs::{ConditionalEdge, EdgePredicate};
/// use deepresearch::types::NodeKind;
/// use std::sync::Arc;
///
/// let predicate: EdgePredicate = Arc::new(|snapshot| {
///     if snapshot.messages.len() > 5 {
///         vec!["many_messages".to_string()]
///     } else {
///         vec!["few_messages".to_string()]
///     }
/// });
/// let edge = ConditionalEdge::new(NodeKind::Start, predicate);
/// assert_eq!(edge.from(), &NodeKind::Start);
/// ```
#[derive(Clone)]
pub struct ConditionalEdge {
    from: NodeKind,
    predicate: EdgePredicate,
}

impl ConditionalEdge {
    pub fn new(from: NodeKind, predicate: EdgePredicate) -> Self {
        Self { from, predicate }
    }

    /// The source node this conditional edge evaluates from.
    pub fn from(&self) -> &NodeKind {
        &self.from
    }

    /// The routing predicate for this edge.
    pub fn predicate(&self) -> &EdgePredicate {
        &self.predicate
    }
}
