//! Remediation engine: validate, schedule, monitor, roll back.
//!
//! One `execute` call owns one workflow instance end to end:
//!
//! 1. Validate the plan; a rejected plan attempts nothing.
//! 2. Run the steps through the conditional scheduler.
//! 3. Observe the post-execution state with the dynamic monitor (skipped when
//!    the workflow was cancelled).
//! 4. Run the rollback coordinator when a trigger fired, or when the steps
//!    failed and `rollback_on_failure` is set.
//! 5. Freeze the metrics and publish the structured result.
//!
//! Running workflows register a `CancellationToken` so they can be cancelled
//! by id from another task.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use remedy_types::config::EngineConfig;
use remedy_types::event::RemediationEvent;
use remedy_types::execution::{
    ExecutionMetrics, FailureCause, MonitoringOutcome, MonitoringReport, ParameterFlow, RollbackResult,
    RollbackStatus, StageExecution, StageStatus, WorkflowOutcome,
};
use remedy_types::plan::RemediationPlan;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::action::ActionExecutor;
use super::context::WorkflowContext;
use super::dag::DagError;
use super::estimator::{ComplexityEstimate, ResourceEstimator};
use super::monitor::DynamicMonitor;
use super::probe::Probe;
use super::rollback::RollbackCoordinator;
use super::scheduler::{ConditionalScheduler, SchedulerReport, StepsOutcome};
use super::validation::{validate_plan, ValidationError};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Internal engine failures. Step failures, rollbacks, cancellation, and
/// rejected plans are outcomes, not errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step graph error: {0}")]
    Graph(#[from] DagError),

    #[error("workflow {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("workflow {0} is not running")]
    NotRunning(Uuid),
}

/// The structured record emitted for every finished workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub workflow_id: Uuid,
    pub plan_id: Uuid,
    pub outcome: WorkflowOutcome,
    pub metrics: ExecutionMetrics,
    pub stages: Vec<StageExecution>,
    pub parameter_flows: Vec<ParameterFlow>,
    pub monitoring: MonitoringReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    pub complexity: ComplexityEstimate,
    pub context: WorkflowContext,
}

impl WorkflowExecutionResult {
    pub fn stage(&self, stage_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }
}

// ---------------------------------------------------------------------------
// RemediationEngine
// ---------------------------------------------------------------------------

pub struct RemediationEngine<E, P> {
    executor: Arc<E>,
    probe: Arc<P>,
    config: EngineConfig,
    event_bus: EventBus,
    /// Cancellation tokens keyed by workflow id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<E: ActionExecutor + 'static, P: Probe + 'static> RemediationEngine<E, P> {
    pub fn new(executor: Arc<E>, probe: Arc<P>, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_capacity);
        Self {
            executor,
            probe,
            config,
            event_bus,
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Publish onto an existing bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn estimator(&self) -> ResourceEstimator {
        ResourceEstimator::new(self.config.resources.clone(), self.config.max_concurrency)
    }

    /// Validate a plan without executing it.
    pub fn validate(
        &self,
        plan: &RemediationPlan,
        ctx: &WorkflowContext,
    ) -> Result<(), ValidationError> {
        validate_plan(plan, ctx, &self.executor.supported_actions(), &self.config)
    }

    /// Ids of workflows currently executing.
    pub fn running(&self) -> Vec<Uuid> {
        self.cancellation_tokens.iter().map(|e| *e.key()).collect()
    }

    /// Cancel a running workflow.
    pub fn cancel(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let token = self
            .cancellation_tokens
            .get(&workflow_id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotRunning(workflow_id))?;
        tracing::info!(workflow_id = %workflow_id, "cancelling workflow");
        token.cancel();
        Ok(())
    }

    /// Execute `plan` against `context`.
    ///
    /// Cancelling `cancel` (or calling [`cancel`](Self::cancel) with the
    /// context's workflow id) stops the workflow cooperatively.
    pub async fn execute(
        &self,
        plan: &RemediationPlan,
        context: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        let workflow_id = context.workflow_id;
        let token = cancel.child_token();
        match self.cancellation_tokens.entry(workflow_id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyRunning(workflow_id)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let result = self.run(plan, context, &token).await;

        self.cancellation_tokens.remove(&workflow_id);
        result
    }

    async fn run(
        &self,
        plan: &RemediationPlan,
        mut ctx: WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        let total_stages = 1 + plan.secondary_actions.len();
        let mut metrics = ExecutionMetrics::start(total_stages);
        let complexity = self.estimator().estimate_complexity(&plan.step_actions());

        if let Err(err) = self.validate(plan, &ctx) {
            tracing::warn!(
                workflow_id = %ctx.workflow_id,
                plan_id = %plan.id,
                error = %err,
                "plan rejected"
            );
            ctx.bind_plan(plan);
            metrics.finalize(ctx.preservation_rate(), self.config.preservation_threshold);
            let result = WorkflowExecutionResult {
                workflow_id: ctx.workflow_id,
                plan_id: plan.id,
                outcome: WorkflowOutcome::ValidationRejected,
                metrics,
                stages: Vec::new(),
                parameter_flows: Vec::new(),
                monitoring: MonitoringReport::skipped(),
                rollback: None,
                validation_errors: err.violations,
                complexity,
                context: ctx,
            };
            return Ok(self.finish(result));
        }

        ctx.bind_plan(plan);
        tracing::info!(
            workflow_id = %ctx.workflow_id,
            plan_id = %plan.id,
            alert = plan.alert_name.as_deref().unwrap_or("unknown"),
            primary = %plan.primary_action.action,
            secondaries = plan.secondary_actions.len(),
            complexity = complexity.overall_score,
            "starting remediation workflow"
        );
        self.event_bus.publish(RemediationEvent::WorkflowStarted {
            workflow_id: ctx.workflow_id,
            plan_id: plan.id,
            total_stages,
        });

        // Steps
        let report = ConditionalScheduler::new(Arc::clone(&self.executor), &self.config)
            .with_events(&self.event_bus)
            .execute(plan, &mut ctx, &mut metrics, cancel)
            .await?;

        // Monitoring
        let monitoring = if report.cancelled {
            MonitoringReport {
                outcome: MonitoringOutcome::Cancelled,
                ..MonitoringReport::skipped()
            }
        } else {
            DynamicMonitor::new(&*self.probe)
                .with_events(&self.event_bus)
                .observe(plan, &ctx, cancel)
                .await
        };
        metrics.set_monitoring_active(monitoring.ticks > 0);

        // Rollback
        let rollback = match self.rollback_trigger(plan, &report, &monitoring) {
            Some(trigger) => {
                metrics.set_rollback_triggered(true);
                let result = RollbackCoordinator::new(&*self.executor, &*self.probe, &self.config.retry)
                    .with_events(&self.event_bus)
                    .rollback(plan, &ctx, &trigger)
                    .await;
                Some(result)
            }
            None => None,
        };

        let cancelled = report.cancelled || monitoring.outcome == MonitoringOutcome::Cancelled;
        let outcome = workflow_outcome(&report, cancelled, rollback.as_ref());
        metrics.finalize(ctx.preservation_rate(), self.config.preservation_threshold);

        let result = WorkflowExecutionResult {
            workflow_id: ctx.workflow_id,
            plan_id: plan.id,
            outcome,
            metrics,
            stages: report.stages,
            parameter_flows: report.flows,
            monitoring,
            rollback,
            validation_errors: Vec::new(),
            complexity,
            context: ctx,
        };
        Ok(self.finish(result))
    }

    /// Why rollback should run, if it should.
    fn rollback_trigger(
        &self,
        plan: &RemediationPlan,
        report: &SchedulerReport,
        monitoring: &MonitoringReport,
    ) -> Option<String> {
        if let MonitoringOutcome::RollbackTriggered { trigger } = &monitoring.outcome {
            return Some(trigger.clone());
        }
        let failed_steps = report.outcome == StepsOutcome::Failed && report.has_step_failure();
        if failed_steps && self.config.rollback_on_failure && !plan.rollback.rollback_actions.is_empty()
        {
            let failed: Vec<&str> = report
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Failed)
                .filter(|s| s.failure.as_ref().is_none_or(|f| f.cause != FailureCause::Cancelled))
                .map(|s| s.stage_id.as_str())
                .collect();
            return Some(format!("step failure: {}", failed.join(", ")));
        }
        None
    }

    fn finish(&self, result: WorkflowExecutionResult) -> WorkflowExecutionResult {
        if result.outcome.requires_attention() {
            tracing::error!(
                workflow_id = %result.workflow_id,
                outcome = ?result.outcome,
                completed = result.metrics.completed_stages,
                failed = result.metrics.failed_stages,
                "remediation workflow requires attention"
            );
        } else {
            tracing::info!(
                workflow_id = %result.workflow_id,
                outcome = ?result.outcome,
                completed = result.metrics.completed_stages,
                failed = result.metrics.failed_stages,
                skipped = result.metrics.skipped_stages,
                duration_ms = result.metrics.duration_ms,
                "remediation workflow finished"
            );
        }
        self.event_bus.publish(RemediationEvent::WorkflowFinished {
            workflow_id: result.workflow_id,
            outcome: result.outcome,
            metrics: result.metrics.clone(),
            stages: result.stages.clone(),
            context: result.context.to_json(),
        });
        result
    }
}

/// Rollback dominates, then cancellation, then the step outcome.
///
/// `cancelled` covers cancellation during the step phase and during monitoring.
fn workflow_outcome(
    report: &SchedulerReport,
    cancelled: bool,
    rollback: Option<&RollbackResult>,
) -> WorkflowOutcome {
    match rollback {
        Some(r) if r.status == RollbackStatus::Succeeded => WorkflowOutcome::RolledBack,
        Some(_) => WorkflowOutcome::PartiallyRolledBack,
        None if cancelled => WorkflowOutcome::Cancelled,
        None => match report.outcome {
            StepsOutcome::Completed => WorkflowOutcome::Completed,
            StepsOutcome::Failed => WorkflowOutcome::Failed,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::workflow::probe::{ExpressionProbe, StaticTelemetry};
    use crate::workflow::testing::{
        monitoring, plan, rollback_action, secondary, ScriptedExecutor, ScriptedProbe, Step,
    };
    use remedy_types::config::RetryPolicy;
    use remedy_types::execution::RollbackActionStatus;
    use remedy_types::plan::{ActionKind, ExecutionCondition, ParameterRule, PRIMARY_STAGE_ID};
    use serde_json::json;
    use std::collections::HashMap;

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 100,
                max_delay_ms: 100,
                jitter: 0.0,
            },
            ..EngineConfig::default()
        }
    }

    fn build_engine<P: Probe + 'static>(
        executor: ScriptedExecutor,
        probe: P,
    ) -> (Arc<ScriptedExecutor>, RemediationEngine<ScriptedExecutor, P>) {
        let executor = Arc::new(executor);
        let engine = RemediationEngine::new(Arc::clone(&executor), Arc::new(probe), config());
        (executor, engine)
    }

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(json!({
            "namespace": "payments",
            "alert_id": "a-123",
            "utilization": 85
        }))
    }

    fn scenario_ab_plan() -> RemediationPlan {
        let mut p = plan(ActionKind::RestartPod);
        p.primary_action.timeout_secs = 10;
        p.secondary_actions = vec![secondary(
            1,
            ActionKind::ScaleDeployment,
            ExecutionCondition::IfPrimaryFails,
        )];
        p
    }

    // -----------------------------------------------------------------------
    // Concrete scenarios
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn scenario_a_primary_succeeds_secondary_skipped() {
        let (executor, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());

        let result = engine
            .execute(&scenario_ab_plan(), ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert_eq!(result.stage("secondary-1").unwrap().status, StageStatus::Skipped);
        assert_eq!(executor.calls("secondary-1"), 0);
        assert!(result.rollback.is_none());
        assert!(result.metrics.is_frozen());
        assert_eq!(result.metrics.completed_stages, 1);
        assert_eq!(result.metrics.skipped_stages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_timed_out_primary_compensated() {
        let executor = ScriptedExecutor::new().script(
            PRIMARY_STAGE_ID,
            vec![Step::delayed(Duration::from_secs(120), json!({}))],
        );
        let (executor, engine) = build_engine(executor, ScriptedProbe::new());

        let result = engine
            .execute(&scenario_ab_plan(), ctx(), CancellationToken::new())
            .await
            .unwrap();

        let primary = result.stage(PRIMARY_STAGE_ID).unwrap();
        assert_eq!(primary.status, StageStatus::Failed);
        assert_eq!(
            primary.failure.as_ref().map(|f| f.cause),
            Some(FailureCause::Timeout)
        );
        assert_eq!(executor.calls("secondary-1"), 1);
        assert_eq!(result.stage("secondary-1").unwrap().status, StageStatus::Completed);
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_c_trigger_fires_after_one_tick() {
        let mut p = plan(ActionKind::IncreaseResources);
        p.monitoring = monitoring(&["pod_ready == true"], 300, 30);
        p.rollback.triggers = vec!["error_rate > 10%".to_string()];
        p.rollback.rollback_actions = vec![rollback_action(1, ActionKind::RollbackDeployment, 60)];
        let probe = ExpressionProbe::new(StaticTelemetry(json!({ "error_rate": 15 })));
        let (executor, engine) = build_engine(ScriptedExecutor::new(), probe);

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.metrics.rollback_triggered);
        assert!(result.metrics.monitoring_active);
        assert_eq!(result.monitoring.ticks, 1);
        assert_eq!(
            result.monitoring.outcome,
            MonitoringOutcome::RollbackTriggered {
                trigger: "error_rate > 10%".to_string()
            }
        );
        assert_eq!(executor.calls("rollback-1"), 1);
        assert_eq!(result.rollback.as_ref().unwrap().trigger, "error_rate > 10%");
        assert_eq!(result.outcome, WorkflowOutcome::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_rollback_timeout_still_rolls_back() {
        let mut p = plan(ActionKind::IncreaseResources);
        p.monitoring = monitoring(&[], 30, 10);
        p.rollback.triggers = vec!["error_rate > 10%".to_string()];
        p.rollback.rollback_timeout_secs = u64::MAX;
        p.rollback.rollback_actions = vec![rollback_action(1, ActionKind::RollbackDeployment, 60)];
        let probe = ExpressionProbe::new(StaticTelemetry(json!({ "error_rate": 15 })));
        let (executor, engine) = build_engine(ScriptedExecutor::new(), probe);

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(executor.calls("rollback-1"), 1);
        assert_eq!(result.outcome, WorkflowOutcome::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_d_partial_rollback() {
        let mut p = plan(ActionKind::IncreaseResources);
        p.monitoring = monitoring(&[], 60, 10);
        p.rollback.triggers = vec!["error_rate > 10%".to_string()];
        p.rollback.rollback_actions = vec![
            rollback_action(1, ActionKind::RollbackDeployment, 60),
            rollback_action(2, ActionKind::RestartPod, 60),
        ];
        let executor = ScriptedExecutor::new()
            .script("rollback-1", vec![Step::permanent("revision 41 not found")]);
        let probe = ScriptedProbe::new().on("error_rate > 10%", vec![true]);
        let (_, engine) = build_engine(executor, probe);

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        let rollback = result.rollback.unwrap();
        assert!(!rollback.success);
        assert_eq!(rollback.status, RollbackStatus::Partial);
        assert_eq!(rollback.actions_executed, 1);
        assert_eq!(
            rollback.errors,
            vec!["action 1 (rollback_deployment): revision 41 not found".to_string()]
        );
        assert_eq!(result.outcome, WorkflowOutcome::PartiallyRolledBack);
        assert!(result.outcome.requires_attention());
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn malformed_plan_is_rejected_before_dispatch() {
        let mut p = scenario_ab_plan();
        p.confidence = 2.0;
        p.context_requirements.required_data = vec!["node_name".to_string()];
        let (executor, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, WorkflowOutcome::ValidationRejected);
        assert_eq!(result.validation_errors.len(), 2);
        assert!(result.stages.is_empty());
        assert!(result.metrics.is_frozen());
        assert!(result.metrics.finished_at.is_some());
        assert!(executor.call_order().is_empty());
        assert!(engine.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn step_failure_runs_rollback_when_enabled() {
        let mut p = plan(ActionKind::IncreaseResources);
        p.rollback.rollback_actions = vec![rollback_action(1, ActionKind::RollbackDeployment, 60)];
        let executor =
            ScriptedExecutor::new().script(PRIMARY_STAGE_ID, vec![Step::permanent("admission denied")]);
        let (executor, engine) = build_engine(executor, ScriptedProbe::new());

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(executor.calls("rollback-1"), 1);
        assert_eq!(result.rollback.as_ref().unwrap().trigger, "step failure: primary");
        assert_eq!(result.outcome, WorkflowOutcome::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn step_failure_without_rollback_is_failed() {
        let mut p = plan(ActionKind::IncreaseResources);
        p.rollback.rollback_actions = vec![rollback_action(1, ActionKind::RollbackDeployment, 60)];
        let executor =
            ScriptedExecutor::new().script(PRIMARY_STAGE_ID, vec![Step::permanent("admission denied")]);
        let executor = Arc::new(executor);
        let engine = RemediationEngine::new(
            Arc::clone(&executor),
            Arc::new(ScriptedProbe::new()),
            EngineConfig {
                rollback_on_failure: false,
                ..config()
            },
        );

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, WorkflowOutcome::Failed);
        assert!(result.rollback.is_none());
        assert_eq!(executor.calls("rollback-1"), 0);
        assert_eq!(result.metrics.failed_stages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_rollback_executes_nothing() {
        let mut p = plan(ActionKind::IncreaseResources);
        p.monitoring = monitoring(&[], 30, 10);
        p.rollback.triggers = vec!["error_rate > 10%".to_string()];
        p.rollback.safety_checks = vec!["replicas_available >= 2".to_string()];
        p.rollback.rollback_actions = vec![rollback_action(1, ActionKind::RollbackDeployment, 60)];
        let probe = ExpressionProbe::new(StaticTelemetry(json!({
            "error_rate": 40,
            "replicas_available": 1
        })));
        let (executor, engine) = build_engine(ScriptedExecutor::new(), probe);

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        let rollback = result.rollback.unwrap();
        assert_eq!(rollback.status, RollbackStatus::Blocked);
        assert_eq!(rollback.actions_executed, 0);
        assert_eq!(rollback.actions[0].status, RollbackActionStatus::NotAttempted);
        assert_eq!(executor.calls("rollback-1"), 0);
        assert_eq!(result.outcome, WorkflowOutcome::PartiallyRolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_success_completes_workflow() {
        let mut p = plan(ActionKind::RestartPod);
        p.monitoring = monitoring(&["pod_ready == true"], 120, 30);
        let probe = ExpressionProbe::new(StaticTelemetry(json!({ "pod_ready": true })));
        let (_, engine) = build_engine(ScriptedExecutor::new(), probe);

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.monitoring.outcome, MonitoringOutcome::Succeeded);
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert!(!result.metrics.rollback_triggered);
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cancel_by_workflow_id() {
        let mut p = scenario_ab_plan();
        p.primary_action.timeout_secs = 300;
        p.monitoring = monitoring(&["pod_ready == true"], 60, 10);
        let executor = ScriptedExecutor::new().script(
            PRIMARY_STAGE_ID,
            vec![Step::delayed(Duration::from_secs(120), json!({}))],
        );
        let (executor, engine) = build_engine(executor, ScriptedProbe::new());
        let engine = Arc::new(engine);

        let context = ctx();
        let workflow_id = context.workflow_id;
        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            runner
                .execute(&p, context, CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.running(), vec![workflow_id]);
        engine.cancel(workflow_id).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Cancelled);
        assert_eq!(result.monitoring.outcome, MonitoringOutcome::Cancelled);
        assert_eq!(
            result.stage(PRIMARY_STAGE_ID).unwrap().failure.as_ref().map(|f| f.cause),
            Some(FailureCause::Cancelled)
        );
        assert_eq!(
            result.stage("secondary-1").unwrap().skip_reason.as_deref(),
            Some("workflow cancelled")
        );
        assert_eq!(executor.calls("secondary-1"), 0);
        assert!(engine.running().is_empty());
        assert!(matches!(
            engine.cancel(workflow_id),
            Err(EngineError::NotRunning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_monitoring_is_cancelled() {
        let mut p = plan(ActionKind::RestartPod);
        p.monitoring = monitoring(&["pod_ready == true"], 600, 10);
        let (executor, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let result = engine.execute(&p, ctx(), cancel).await.unwrap();

        assert_eq!(executor.calls(PRIMARY_STAGE_ID), 1);
        assert_eq!(result.stage(PRIMARY_STAGE_ID).unwrap().status, StageStatus::Completed);
        assert_eq!(result.monitoring.outcome, MonitoringOutcome::Cancelled);
        assert_eq!(result.monitoring.ticks, 2);
        assert!(result.rollback.is_none());
        assert_eq!(result.outcome, WorkflowOutcome::Cancelled);
    }

    #[tokio::test]
    async fn unsupported_action_is_rejected() {
        let mut p = scenario_ab_plan();
        p.rollback.rollback_actions = vec![rollback_action(1, ActionKind::RollbackDeployment, 60)];
        let executor = ScriptedExecutor::new()
            .with_supported(vec![ActionKind::RestartPod, ActionKind::ScaleDeployment]);
        let (executor, engine) = build_engine(executor, ScriptedProbe::new());

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, WorkflowOutcome::ValidationRejected);
        assert_eq!(
            result.validation_errors,
            vec!["action 'rollback_deployment' is not supported by the executor".to_string()]
        );
        assert!(executor.call_order().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_after_failure_still_rolls_back() {
        let mut p = plan(ActionKind::DrainNode);
        p.primary_action.timeout_secs = 300;
        p.secondary_actions = vec![secondary(
            1,
            ActionKind::CordonNode,
            ExecutionCondition::ParallelWithPrimary,
        )];
        p.rollback.rollback_actions = vec![rollback_action(1, ActionKind::RollbackDeployment, 60)];
        let executor = ScriptedExecutor::new()
            .script(
                PRIMARY_STAGE_ID,
                vec![Step::delayed(Duration::from_secs(120), json!({}))],
            )
            .script(
                "secondary-1",
                vec![Step::delayed_failure(Duration::from_secs(2), "node not found")],
            );
        let (executor, engine) = build_engine(executor, ScriptedProbe::new());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result = engine.execute(&p, ctx(), cancel).await.unwrap();

        assert_eq!(executor.calls("rollback-1"), 1);
        assert_eq!(result.outcome, WorkflowOutcome::RolledBack);
        assert_eq!(
            result.rollback.as_ref().unwrap().trigger,
            "step failure: secondary-1"
        );
        assert_eq!(
            result.stage(PRIMARY_STAGE_ID).unwrap().failure.as_ref().map(|f| f.cause),
            Some(FailureCause::Cancelled)
        );
    }

    // -----------------------------------------------------------------------
    // Context, flows, events
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn preservation_rate_is_exact() {
        let mut p = plan(ActionKind::RestartPod);
        p.context_requirements.preservation_keys =
            vec!["alert_id".to_string(), "namespace".to_string()];
        p.secondary_actions = vec![secondary(
            1,
            ActionKind::NotifyOnly,
            ExecutionCondition::AfterPrimary,
        )];
        let (_, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.metrics.preservation_rate, 1.0);
        assert!(result.metrics.context_preservation);
        assert!(result.stages.iter().all(|s| s.context_preserved));

        let executor = ScriptedExecutor::new().script(
            "secondary-1",
            vec![Step::ok(json!({ "context": { "alert_id": null } }))],
        );
        let (_, engine) = build_engine(executor, ScriptedProbe::new());
        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.metrics.preservation_rate, 0.5);
        assert!(!result.metrics.context_preservation);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let executor = ScriptedExecutor::new().script(
            PRIMARY_STAGE_ID,
            vec![Step::transient("429 too many requests"), Step::ok(json!({ "restarted": 1 }))],
        );
        let (executor, engine) = build_engine(executor, ScriptedProbe::new());

        let result = engine
            .execute(&plan(ActionKind::RestartPod), ctx(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stage(PRIMARY_STAGE_ID).unwrap().attempts, 2);
        assert_eq!(executor.calls(PRIMARY_STAGE_ID), 2);
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_flow_is_reported_not_fatal() {
        let mut p = plan(ActionKind::ScaleDeployment);
        p.primary_action.parameters = HashMap::from([("replicas".to_string(), json!(5))]);
        let mut follow = secondary(1, ActionKind::ScaleDeployment, ExecutionCondition::AfterPrimary);
        follow.parameter_rules = vec![ParameterRule {
            source_stage: PRIMARY_STAGE_ID.to_string(),
            source_parameter: "replicas".to_string(),
            target_parameter: "replicas".to_string(),
            transform: "double_it".to_string(),
            args: HashMap::new(),
        }];
        p.secondary_actions = vec![follow];
        let (executor, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());
        let mut rx = engine.event_bus().subscribe();

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert!(!result.metrics.parameter_flow_success);
        assert_eq!(executor.calls("secondary-1"), 1);

        let mut degraded = false;
        while let Ok(event) = rx.try_recv() {
            degraded |= matches!(event, RemediationEvent::ParameterFlowDegraded { failed_rules: 1, .. });
        }
        assert!(degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn events_bracket_the_workflow() {
        let (_, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());
        let mut rx = engine.event_bus().subscribe();

        let result = engine
            .execute(&scenario_ab_plan(), ctx(), CancellationToken::new())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(RemediationEvent::WorkflowStarted { total_stages: 2, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RemediationEvent::StageSkipped { stage_id, .. } if stage_id == "secondary-1")));
        match events.last() {
            Some(RemediationEvent::WorkflowFinished {
                workflow_id,
                outcome,
                stages,
                ..
            }) => {
                assert_eq!(*workflow_id, result.workflow_id);
                assert_eq!(*outcome, WorkflowOutcome::Completed);
                assert_eq!(stages.len(), 2);
            }
            other => panic!("expected WorkflowFinished, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn yaml_plan_runs_end_to_end() {
        let yaml = r#"
alert_name: HighMemoryUsage
confidence: 0.9
target:
  namespace: payments
  kind: Deployment
  name: api
primary_action:
  action: increase_resources
  timeout_secs: 60
  parameters:
    memory_limit: 512Mi
secondary_actions:
  - action: restart_pod
    execution_order: 1
    condition: after_primary
    parameter_rules:
      - source_parameter: memory_limit
        target_parameter: memory_limit
context_requirements:
  preservation_keys: [alert_id]
"#;
        let p: RemediationPlan = serde_yaml_ng::from_str(yaml).unwrap();
        let (executor, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());

        let result = engine
            .execute(&p, ctx(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert_eq!(
            executor.last_request("secondary-1").unwrap().parameters["memory_limit"],
            json!("512Mi")
        );
        assert_eq!(result.parameter_flows.len(), 1);
        assert!(result.metrics.parameter_flow_success);
        assert!(result.metrics.context_preservation);
    }

    #[tokio::test]
    async fn duplicate_workflow_id_is_rejected() {
        let (_, engine) = build_engine(ScriptedExecutor::new(), ScriptedProbe::new());
        let context = ctx();
        engine
            .cancellation_tokens
            .insert(context.workflow_id, CancellationToken::new());

        let err = engine
            .execute(&plan(ActionKind::RestartPod), context, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
    }

    #[test]
    fn cancellation_without_rollback_is_cancelled() {
        let report = SchedulerReport {
            outcome: StepsOutcome::Completed,
            stages: vec![],
            flows: vec![],
            cancelled: true,
            concurrency: 1,
        };
        assert_eq!(workflow_outcome(&report, true, None), WorkflowOutcome::Cancelled);

        let report = SchedulerReport {
            cancelled: false,
            ..report
        };
        assert_eq!(workflow_outcome(&report, false, None), WorkflowOutcome::Completed);
        assert_eq!(workflow_outcome(&report, true, None), WorkflowOutcome::Cancelled);
    }
}
