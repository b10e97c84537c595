//! Graph compilation logic and validation.
//!
//! This module contains the logic for compiling a GraphBuilder into an
//! executable App, including future validation and error handling.

use crate::app::App;
use miette::Diagnostic;
use thiserror::Error;

/// Reserved for future structural validation (cycles, unreachable nodes, …).
///
/// `GraphBuilder::compile` does not currently return `Result`; this type
/// exists so that adding validation later is not a breaking API change.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphCompileError {
    #[error("graph has no edges originating from Start")]
    #[diagnostic(code(deepresearch::graphs::no_start_edges))]
    NoStartEdges,

    #[error("graph contains a cycle")]
    #[diagnostic(code(deepresearch::graphs::cyclic))]
    Cyclic,
}

/// Compilation logic for GraphBuilder.
impl super::builder::GraphBuilder {
    /// Compiles the graph into an executable application.
    ///
    /// Validates the graph configuration and converts it into an [`App`] that
    /// can execute workflows. This method performs several validation checks:
    ///
    /// - Future: cycle detection, reachability analysis
    /// - Future: validation that at least one edge originates from Start
    ///
    /// # Returns
    ///
    /// - `Ok(App)`: Successfully compiled application ready for execution
    ///
    /// # Errors
    ///
    /// Currently none. (Reserved for future structural validation errors.)
    pub fn compile(self) -> App {
        let (nodes, edges, conditional_edges, runtime_config, reducer_registry) =
            self.into_parts();
        App::from_parts(nodes, edges, conditional_edges, reducer_registry, runtime_config)
    }
}
