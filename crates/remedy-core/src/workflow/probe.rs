//! Probe port used by the dynamic monitor and the rollback coordinator.
//!
//! A probe answers one question: does this criterion hold right now? The
//! concrete source of truth (cluster state, metrics, logs) is external. The
//! bundled `ExpressionProbe` evaluates criteria with the fixed-grammar
//! evaluator over a telemetry snapshot merged with the workflow context.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::context::WorkflowContext;
use super::expression::{ConditionEvaluator, ExpressionError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeError {
    #[error("criterion could not be evaluated: {0}")]
    Expression(#[from] ExpressionError),

    #[error("telemetry unavailable: {0}")]
    Unavailable(String),
}

/// Samples a criterion expression against current observable state.
pub trait Probe: Send + Sync {
    fn sample(
        &self,
        criterion: &str,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<bool, ProbeError>> + Send;
}

impl<T: Probe> Probe for Arc<T> {
    fn sample(
        &self,
        criterion: &str,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<bool, ProbeError>> + Send {
        (**self).sample(criterion, ctx)
    }
}

/// Supplies a JSON telemetry snapshot (metric name -> value).
pub trait TelemetrySource: Send + Sync {
    fn snapshot(
        &self,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<Value, ProbeError>> + Send;
}

/// A fixed telemetry snapshot.
#[derive(Debug, Clone)]
pub struct StaticTelemetry(pub Value);

impl TelemetrySource for StaticTelemetry {
    async fn snapshot(&self, _ctx: &WorkflowContext) -> Result<Value, ProbeError> {
        Ok(self.0.clone())
    }
}

/// Evaluates criteria over `telemetry ∪ context`.
///
/// Telemetry keys live at the root (`error_rate > 10%`); the workflow context
/// is reachable under `alert`, `system`, `stages`, and friends. Telemetry
/// never shadows those context roots.
#[derive(Debug, Clone)]
pub struct ExpressionProbe<S> {
    source: S,
    evaluator: ConditionEvaluator,
}

impl<S: TelemetrySource> ExpressionProbe<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            evaluator: ConditionEvaluator::new(),
        }
    }
}

impl<S: TelemetrySource> Probe for ExpressionProbe<S> {
    async fn sample(&self, criterion: &str, ctx: &WorkflowContext) -> Result<bool, ProbeError> {
        let telemetry = self.source.snapshot(ctx).await?;
        let mut scope = ctx.to_expression_context();
        if let (Some(scope_map), Value::Object(metrics)) = (scope.as_object_mut(), telemetry) {
            for (key, value) in metrics {
                scope_map.entry(key).or_insert(value);
            }
        }
        Ok(self.evaluator.evaluate_bool(criterion, &scope)?)
    }
}
