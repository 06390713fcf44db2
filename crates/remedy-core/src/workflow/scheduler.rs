//! Conditional scheduler: runs the primary action and its secondaries.
//!
//! Execution happens in two phases:
//!
//! 1. The primary action and every `parallel_with_primary` secondary are
//!    spawned together, each under its own deadline.
//! 2. Once the primary's terminal status is merged into the context, the
//!    remaining secondaries run in prerequisite waves. `if_primary_fails`
//!    steps are skipped when the primary completed; steps whose
//!    prerequisites did not complete are skipped with the reason recorded.
//!
//! Steps within a wave run concurrently via `tokio::JoinSet`, bounded by a
//! semaphore. Tasks never touch the context: they hand their outcome back
//! and the scheduler merges it, so every context write happens here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use remedy_types::config::EngineConfig;
use remedy_types::event::RemediationEvent;
use remedy_types::execution::{
    ExecutionMetrics, FailureCause, ParameterFlow, StageExecution, StageFailure, StageStatus,
};
use remedy_types::plan::{
    ActionKind, ActionTarget, ExecutionCondition, ParameterRule, RemediationPlan,
    SecondaryAction, PRIMARY_STAGE_ID,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::action::{ActionExecutor, ActionRequest};
use super::context::WorkflowContext;
use super::dag::{build_waves, DagError};
use super::dispatch::{dispatch, DispatchOutcome};
use super::estimator::ResourceEstimator;
use super::parameter_flow::ParameterFlowEngine;
use crate::event::EventBus;

/// Skip reason for stages never dispatched because the workflow was cancelled.
pub const SKIP_CANCELLED: &str = "workflow cancelled";

/// Skip reason for `if_primary_fails` stages when the primary completed.
pub const SKIP_PRIMARY_SUCCEEDED: &str = "primary action succeeded";

/// Terminal status of the step phase, before monitoring and rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepsOutcome {
    Completed,
    Failed,
}

/// Everything the step phase produced.
#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub outcome: StepsOutcome,
    /// Stage history in merge order.
    pub stages: Vec<StageExecution>,
    pub flows: Vec<ParameterFlow>,
    pub cancelled: bool,
    /// Size of the worker pool used.
    pub concurrency: usize,
}

impl SchedulerReport {
    pub fn stage(&self, stage_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Whether any stage failed for a reason other than cancellation.
    pub fn has_step_failure(&self) -> bool {
        self.stages.iter().any(|s| {
            s.status == StageStatus::Failed
                && s.failure.as_ref().is_none_or(|f| f.cause != FailureCause::Cancelled)
        })
    }
}

// ---------------------------------------------------------------------------
// Stage specs
// ---------------------------------------------------------------------------

/// A dispatchable step, primary or secondary, with its plan-level settings.
struct StageSpec<'p> {
    stage_id: String,
    action: ActionKind,
    order: u32,
    condition: Option<ExecutionCondition>,
    timeout: Duration,
    parameters: &'p HashMap<String, Value>,
    rules: &'p [ParameterRule],
    target: ActionTarget,
}

impl<'p> StageSpec<'p> {
    fn primary(plan: &'p RemediationPlan) -> Self {
        let primary = &plan.primary_action;
        Self {
            stage_id: PRIMARY_STAGE_ID.to_string(),
            action: primary.action,
            order: 0,
            condition: None,
            timeout: Duration::from_secs(primary.timeout_secs),
            parameters: &primary.parameters,
            rules: &[],
            target: primary.target.clone().unwrap_or_else(|| plan.target.clone()),
        }
    }

    fn secondary(plan: &'p RemediationPlan, step: &'p SecondaryAction) -> Self {
        Self {
            stage_id: step.stage_id(),
            action: step.action,
            order: step.execution_order,
            condition: Some(step.condition),
            timeout: Duration::from_secs(step.timeout_secs),
            parameters: &step.parameters,
            rules: &step.parameter_rules,
            target: step.target.clone().unwrap_or_else(|| plan.target.clone()),
        }
    }
}

/// Bookkeeping for a spawned stage until its outcome is merged.
struct InFlight {
    action: ActionKind,
    order: u32,
    condition: Option<ExecutionCondition>,
    parameters: HashMap<String, Value>,
}

type TaskOutput = (String, DispatchOutcome, DateTime<Utc>, DateTime<Utc>);

// ---------------------------------------------------------------------------
// ConditionalScheduler
// ---------------------------------------------------------------------------

pub struct ConditionalScheduler<'a, E> {
    executor: Arc<E>,
    config: &'a EngineConfig,
    flow: ParameterFlowEngine,
    events: Option<&'a EventBus>,
}

impl<'a, E: ActionExecutor + 'static> ConditionalScheduler<'a, E> {
    pub fn new(executor: Arc<E>, config: &'a EngineConfig) -> Self {
        Self {
            executor,
            config,
            flow: ParameterFlowEngine::new(config.rounding),
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Run every step of `plan`, merging results into `ctx` and `metrics`.
    ///
    /// The primary and its `parallel_with_primary` steps always start
    /// together, even when that exceeds the worker pool. Later waves are
    /// bounded by the pool.
    pub async fn execute(
        &self,
        plan: &RemediationPlan,
        ctx: &mut WorkflowContext,
        metrics: &mut ExecutionMetrics,
        cancel: &CancellationToken,
    ) -> Result<SchedulerReport, DagError> {
        let estimator =
            ResourceEstimator::new(self.config.resources.clone(), self.config.max_concurrency);
        let allocation = estimator.allocate_resources(&plan.step_actions());
        let concurrency = self
            .config
            .max_concurrency
            .max(1)
            .min(allocation.max_concurrency);
        let pool = Arc::new(Semaphore::new(concurrency));

        // Build the waves up front so a malformed graph fails before dispatch.
        let mut parallel: Vec<&SecondaryAction> = Vec::new();
        let mut post_primary: Vec<&SecondaryAction> = Vec::new();
        for step in &plan.secondary_actions {
            if step.condition == ExecutionCondition::ParallelWithPrimary {
                parallel.push(step);
            } else {
                post_primary.push(step);
            }
        }
        parallel.sort_by_key(|s| s.execution_order);
        let waves = build_waves(&post_primary)?;

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            parallel = parallel.len(),
            waves = waves.len(),
            concurrency,
            "scheduling steps"
        );

        let mut report = SchedulerReport {
            outcome: StepsOutcome::Failed,
            stages: Vec::new(),
            flows: Vec::new(),
            cancelled: false,
            concurrency,
        };

        // Phase 1: primary together with parallel secondaries.
        let mut first = vec![StageSpec::primary(plan)];
        first.extend(parallel.iter().map(|s| StageSpec::secondary(plan, *s)));
        let first_pool = Arc::new(Semaphore::new(concurrency.max(first.len())));
        self.run_wave(first, ctx, metrics, &mut report, &first_pool, cancel)
            .await;

        // Phase 2: conditional secondaries, primary outcome now visible.
        let primary_completed = ctx.stage_status(PRIMARY_STAGE_ID) == Some(StageStatus::Completed);
        for wave in waves {
            let mut runnable = Vec::with_capacity(wave.len());
            for step in wave {
                let spec = StageSpec::secondary(plan, step);
                if cancel.is_cancelled() {
                    self.skip(spec, None, SKIP_CANCELLED.to_string(), ctx, metrics, &mut report);
                    continue;
                }
                if step.condition == ExecutionCondition::IfPrimaryFails && primary_completed {
                    self.skip(
                        spec,
                        Some(false),
                        SKIP_PRIMARY_SUCCEEDED.to_string(),
                        ctx,
                        metrics,
                        &mut report,
                    );
                    continue;
                }
                if let Some(missing) = step.prerequisites.iter().find(|p| !ctx.is_completed(p)) {
                    let reason = format!("prerequisite '{missing}' did not complete");
                    self.skip(spec, Some(true), reason, ctx, metrics, &mut report);
                    continue;
                }
                runnable.push(spec);
            }
            if !runnable.is_empty() {
                self.run_wave(runnable, ctx, metrics, &mut report, &pool, cancel)
                    .await;
            }
        }

        report.cancelled = cancel.is_cancelled();
        report.outcome = steps_outcome(plan, ctx);
        tracing::info!(
            workflow_id = %ctx.workflow_id,
            outcome = ?report.outcome,
            cancelled = report.cancelled,
            stages = report.stages.len(),
            "step phase finished"
        );
        Ok(report)
    }

    /// Dispatch `specs` concurrently and merge their outcomes.
    async fn run_wave(
        &self,
        specs: Vec<StageSpec<'_>>,
        ctx: &mut WorkflowContext,
        metrics: &mut ExecutionMetrics,
        report: &mut SchedulerReport,
        pool: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        let mut join_set: JoinSet<TaskOutput> = JoinSet::new();
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();

        for spec in specs {
            if cancel.is_cancelled() {
                self.skip(spec, None, SKIP_CANCELLED.to_string(), ctx, metrics, report);
                continue;
            }

            let parameters = self.project_parameters(&spec, ctx, metrics, report);

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(pool).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.skip(spec, None, SKIP_CANCELLED.to_string(), ctx, metrics, report);
                continue;
            };

            ctx.begin_stage(&spec.stage_id);
            tracing::info!(
                workflow_id = %ctx.workflow_id,
                stage_id = spec.stage_id.as_str(),
                action = %spec.action,
                timeout_secs = spec.timeout.as_secs(),
                "dispatching stage"
            );
            self.publish(RemediationEvent::StageStarted {
                workflow_id: ctx.workflow_id,
                stage_id: spec.stage_id.clone(),
                action: spec.action,
            });

            let request = ActionRequest {
                workflow_id: ctx.workflow_id,
                stage_id: spec.stage_id.clone(),
                action: spec.action,
                target: spec.target.clone(),
                parameters: parameters.clone(),
                attempt: 1,
            };
            in_flight.insert(
                spec.stage_id.clone(),
                InFlight {
                    action: spec.action,
                    order: spec.order,
                    condition: spec.condition,
                    parameters,
                },
            );

            let executor = Arc::clone(&self.executor);
            let retry = self.config.retry.clone();
            let token = cancel.clone();
            let stage_id = spec.stage_id;
            let timeout = spec.timeout;
            join_set.spawn(async move {
                let _permit = permit;
                let started_at = Utc::now();
                let outcome = dispatch(&*executor, request, timeout, &retry, &token).await;
                (stage_id, outcome, started_at, Utc::now())
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((stage_id, outcome, started_at, ended_at)) => {
                    if let Some(flight) = in_flight.remove(&stage_id) {
                        self.merge(stage_id, flight, outcome, started_at, ended_at, ctx, metrics, report);
                    }
                }
                Err(err) => {
                    tracing::error!(workflow_id = %ctx.workflow_id, error = %err, "stage task aborted");
                }
            }
        }

        // Tasks that panicked never reported back.
        for (stage_id, flight) in in_flight.drain() {
            let now = Utc::now();
            let outcome = DispatchOutcome::Failed {
                cause: FailureCause::ActionError,
                message: "stage task aborted".to_string(),
                attempts: 0,
            };
            self.merge(stage_id, flight, outcome, now, now, ctx, metrics, report);
        }
    }

    /// Apply the step's parameter rules; flow output overrides declared values.
    fn project_parameters(
        &self,
        spec: &StageSpec<'_>,
        ctx: &WorkflowContext,
        metrics: &mut ExecutionMetrics,
        report: &mut SchedulerReport,
    ) -> HashMap<String, Value> {
        let mut parameters = spec.parameters.clone();
        for flow in self.flow.flows_for_step(&spec.stage_id, spec.rules, ctx) {
            metrics.record_flow(flow.flow_success);
            if !flow.flow_success {
                let failed_rules = flow
                    .transformation_log
                    .iter()
                    .filter(|entry| !entry.applied)
                    .count();
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    source_stage = flow.source_stage.as_str(),
                    target_stage = flow.target_stage.as_str(),
                    failed_rules,
                    "parameter flow degraded"
                );
                self.publish(RemediationEvent::ParameterFlowDegraded {
                    workflow_id: ctx.workflow_id,
                    source_stage: flow.source_stage.clone(),
                    target_stage: flow.target_stage.clone(),
                    failed_rules,
                });
            }
            parameters.extend(flow.parameters.clone());
            report.flows.push(flow);
        }
        parameters
    }

    #[allow(clippy::too_many_arguments)]
    fn merge(
        &self,
        stage_id: String,
        flight: InFlight,
        outcome: DispatchOutcome,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        ctx: &mut WorkflowContext,
        metrics: &mut ExecutionMetrics,
        report: &mut SchedulerReport,
    ) {
        let attempts = outcome.attempts();
        let (status, result, failure) = match outcome {
            DispatchOutcome::Completed { output, .. } => (StageStatus::Completed, Some(output), None),
            DispatchOutcome::Failed { cause, message, .. } => (
                StageStatus::Failed,
                None,
                Some(StageFailure { cause, message }),
            ),
        };

        let context_preserved = ctx.record_stage_result(
            &stage_id,
            flight.action.as_str(),
            status,
            result.clone(),
            flight.parameters.clone(),
        );
        metrics.record_stage(status);

        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        match &failure {
            None => {
                tracing::info!(
                    workflow_id = %ctx.workflow_id,
                    stage_id = stage_id.as_str(),
                    duration_ms,
                    attempts,
                    "stage completed"
                );
                self.publish(RemediationEvent::StageCompleted {
                    workflow_id: ctx.workflow_id,
                    stage_id: stage_id.clone(),
                    duration_ms,
                    attempts,
                });
            }
            Some(f) => {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    stage_id = stage_id.as_str(),
                    cause = ?f.cause,
                    error = f.message.as_str(),
                    attempts,
                    "stage failed"
                );
                self.publish(RemediationEvent::StageFailed {
                    workflow_id: ctx.workflow_id,
                    stage_id: stage_id.clone(),
                    cause: f.cause,
                    error: f.message.clone(),
                });
            }
        }

        report.stages.push(StageExecution {
            stage_id,
            action: flight.action,
            order: flight.order,
            started_at: Some(started_at),
            ended_at: Some(ended_at),
            status,
            parameters: flight.parameters,
            result,
            condition: flight.condition,
            condition_met: flight.condition.map(|_| true),
            context_preserved,
            failure,
            skip_reason: None,
            attempts,
        });
    }

    fn skip(
        &self,
        spec: StageSpec<'_>,
        condition_met: Option<bool>,
        reason: String,
        ctx: &mut WorkflowContext,
        metrics: &mut ExecutionMetrics,
        report: &mut SchedulerReport,
    ) {
        tracing::info!(
            workflow_id = %ctx.workflow_id,
            stage_id = spec.stage_id.as_str(),
            reason = reason.as_str(),
            "stage skipped"
        );
        let context_preserved = ctx.record_stage_result(
            &spec.stage_id,
            spec.action.as_str(),
            StageStatus::Skipped,
            None,
            HashMap::new(),
        );
        metrics.record_stage(StageStatus::Skipped);
        self.publish(RemediationEvent::StageSkipped {
            workflow_id: ctx.workflow_id,
            stage_id: spec.stage_id.clone(),
            reason: reason.clone(),
        });

        let mut stage =
            StageExecution::skipped(spec.stage_id, spec.action, spec.order, spec.condition, reason);
        stage.condition_met = condition_met;
        stage.context_preserved = context_preserved;
        report.stages.push(stage);
    }

    fn publish(&self, event: RemediationEvent) {
        if let Some(events) = self.events {
            events.publish(event);
        }
    }
}

/// Completed when the primary (or a compensating `if_primary_fails` step)
/// completed and every other secondary completed or was skipped.
fn steps_outcome(plan: &RemediationPlan, ctx: &WorkflowContext) -> StepsOutcome {
    let primary_ok = ctx.stage_status(PRIMARY_STAGE_ID) == Some(StageStatus::Completed);
    let mut compensated = false;
    let mut others_ok = true;
    for step in &plan.secondary_actions {
        let status = ctx.stage_status(&step.stage_id());
        if step.condition == ExecutionCondition::IfPrimaryFails {
            compensated |= status == Some(StageStatus::Completed);
        } else {
            others_ok &= matches!(status, Some(StageStatus::Completed | StageStatus::Skipped));
        }
    }
    if (primary_ok || compensated) && others_ok {
        StepsOutcome::Completed
    } else {
        StepsOutcome::Failed
    }
}
