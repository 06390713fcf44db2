//! Remediation workflow engine.
//!
//! - `validation` -- plan checks run before anything is dispatched
//! - `dag` -- prerequisite graph, cycle detection, dependency waves
//! - `context` -- per-workflow context store and preserved data
//! - `expression` -- fixed-grammar condition evaluator
//! - `parameter_flow` -- named transforms from completed stages into later steps
//! - `action` / `dispatch` / `retry` -- executor seam, deadlines, backoff
//! - `scheduler` -- conditional scheduling of primary and secondary steps
//! - `probe` / `monitor` -- post-execution monitoring and rollback triggers
//! - `rollback` -- ordered compensation under safety checks and a timeout
//! - `estimator` -- complexity score and worker pool sizing
//! - `engine` -- end-to-end orchestration and outcome mapping

pub mod action;
pub mod context;
pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod estimator;
pub mod expression;
pub mod monitor;
pub mod parameter_flow;
pub mod probe;
pub mod quantity;
pub mod retry;
pub mod rollback;
pub mod scheduler;
pub mod validation;

#[cfg(test)]
mod testing;

pub use action::{ActionError, ActionExecutor, ActionRequest};
pub use context::WorkflowContext;
pub use engine::{EngineError, RemediationEngine, WorkflowExecutionResult};
pub use probe::{ExpressionProbe, Probe, ProbeError, TelemetrySource};
