//! Identifier generation for runs, sessions, and subtasks.

use uuid::Uuid;

/// Generates short, prefixed, collision-resistant identifiers.
///
/// Wraps [`uuid::Uuid::new_v4`] behind a small type so call sites read as
/// intent ("generate a run id") rather than "make a UUID".
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generates an identifier for a single workflow run/session.
    pub fn generate_run_id(&self) -> String {
        format!("run_{}", Uuid::new_v4())
    }

    /// Generates an identifier for a research subtask.
    pub fn generate_subtask_id(&self) -> String {
        format!("subtask_{}", Uuid::new_v4())
    }

    /// Generates an identifier prefixed with an arbitrary namespace.
    pub fn generate_with_prefix(&self, prefix: &str) -> String {
        format!("{prefix}_{}", Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let gen = IdGenerator::new();
        let a = gen.generate_run_id();
        let b = gen.generate_run_id();
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
    }
}
