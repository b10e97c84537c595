//! Concurrent execution and dependency resolution for workflow supersteps.
//!
//! The [`Scheduler`] drives a single "superstep": it decides which frontier
//! nodes actually need to run (gating on channel versions they haven't seen
//! yet), executes them concurrently under a bounded permit pool, and collects
//! their outputs for the barrier to merge.

pub mod scheduler;

pub use scheduler::{Scheduler, SchedulerError, SchedulerState, StepRunResult};
