//! Rollback coordinator: runs the plan's compensating actions.
//!
//! Safety checks gate the whole sequence. Actions run strictly in
//! `execution_order`, best effort: one failure does not stop the next. The
//! sequence is bounded by `rollback_timeout`; actions the budget never
//! reached are recorded as not attempted.
//!
//! Rollback runs under its own cancellation scope. A workflow cancellation
//! must not abort a compensation already in progress.

use std::time::Duration;

use remedy_types::config::RetryPolicy;
use remedy_types::event::RemediationEvent;
use remedy_types::execution::{
    RollbackActionRecord, RollbackActionStatus, RollbackResult, RollbackStatus,
};
use remedy_types::plan::{RemediationPlan, RollbackAction};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::action::{ActionExecutor, ActionRequest};
use super::context::WorkflowContext;
use super::dispatch::{dispatch, DispatchOutcome};
use super::probe::Probe;
use crate::event::EventBus;

/// Stage id used when dispatching a rollback action.
pub fn rollback_stage_id(action: &RollbackAction) -> String {
    format!("rollback-{}", action.execution_order)
}

pub struct RollbackCoordinator<'a, E, P> {
    executor: &'a E,
    probe: &'a P,
    retry: &'a RetryPolicy,
    events: Option<&'a EventBus>,
}

impl<'a, E: ActionExecutor, P: Probe> RollbackCoordinator<'a, E, P> {
    pub fn new(executor: &'a E, probe: &'a P, retry: &'a RetryPolicy) -> Self {
        Self {
            executor,
            probe,
            retry,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Execute the plan's rollback, started by `trigger`.
    pub async fn rollback(
        &self,
        plan: &RemediationPlan,
        ctx: &WorkflowContext,
        trigger: &str,
    ) -> RollbackResult {
        let rollback = &plan.rollback;
        let mut actions: Vec<&RollbackAction> = rollback.rollback_actions.iter().collect();
        actions.sort_by_key(|a| a.execution_order);

        tracing::warn!(
            workflow_id = %ctx.workflow_id,
            trigger,
            actions = actions.len(),
            "rollback started"
        );
        self.publish(RemediationEvent::RollbackStarted {
            workflow_id: ctx.workflow_id,
            trigger: trigger.to_string(),
            actions: actions.len(),
        });

        let deadline = deadline_after(Duration::from_secs(rollback.rollback_timeout_secs));

        if let Some(blocked_by) = self.failed_safety_check(plan, ctx, deadline).await {
            tracing::error!(
                workflow_id = %ctx.workflow_id,
                check = blocked_by.as_str(),
                "rollback blocked by safety check"
            );
            let result = RollbackResult {
                status: RollbackStatus::Blocked,
                success: false,
                actions_executed: 0,
                errors: vec![format!("rollback blocked by safety check: {blocked_by}")],
                actions: actions
                    .iter()
                    .map(|a| not_attempted(a))
                    .collect(),
                timed_out: false,
                blocked_by: Some(blocked_by),
                trigger: trigger.to_string(),
            };
            return self.finish(ctx, result);
        }

        // Never cancelled: compensation is not aborted by workflow cancellation.
        let scope = CancellationToken::new();
        let mut records = Vec::with_capacity(actions.len());
        let mut errors = Vec::new();
        let mut timed_out = false;

        for action in actions {
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                records.push(not_attempted(action));
                continue;
            }
            let own = Duration::from_secs(action.timeout_secs);
            let budget = own.min(deadline - now);

            let request = ActionRequest {
                workflow_id: ctx.workflow_id,
                stage_id: rollback_stage_id(action),
                action: action.action,
                target: action.target.clone().unwrap_or_else(|| plan.target.clone()),
                parameters: action.parameters.clone(),
                attempt: 1,
            };
            let outcome = dispatch(self.executor, request, budget, self.retry, &scope).await;

            match outcome {
                DispatchOutcome::Completed { attempts, .. } => {
                    tracing::info!(
                        workflow_id = %ctx.workflow_id,
                        order = action.execution_order,
                        action = %action.action,
                        "rollback action completed"
                    );
                    records.push(RollbackActionRecord {
                        execution_order: action.execution_order,
                        action: action.action,
                        status: RollbackActionStatus::Completed,
                        error: None,
                        attempts,
                    });
                }
                DispatchOutcome::Failed {
                    message, attempts, ..
                } => {
                    if Instant::now() >= deadline {
                        timed_out = true;
                    }
                    let error = format!(
                        "action {} ({}): {}",
                        action.execution_order, action.action, message
                    );
                    tracing::error!(
                        workflow_id = %ctx.workflow_id,
                        order = action.execution_order,
                        action = %action.action,
                        error = error.as_str(),
                        "rollback action failed, continuing"
                    );
                    errors.push(error.clone());
                    records.push(RollbackActionRecord {
                        execution_order: action.execution_order,
                        action: action.action,
                        status: RollbackActionStatus::Failed,
                        error: Some(error),
                        attempts,
                    });
                }
            }
        }

        let completed = records
            .iter()
            .filter(|r| r.status == RollbackActionStatus::Completed)
            .count();
        let status = if completed == records.len() {
            RollbackStatus::Succeeded
        } else if completed == 0 {
            RollbackStatus::Failed
        } else {
            RollbackStatus::Partial
        };

        let result = RollbackResult {
            status,
            success: status == RollbackStatus::Succeeded,
            actions_executed: completed,
            errors,
            actions: records,
            timed_out,
            blocked_by: None,
            trigger: trigger.to_string(),
        };
        self.finish(ctx, result)
    }

    /// The first safety check that does not hold, if any.
    async fn failed_safety_check(
        &self,
        plan: &RemediationPlan,
        ctx: &WorkflowContext,
        deadline: Instant,
    ) -> Option<String> {
        for check in &plan.rollback.safety_checks {
            match tokio::time::timeout_at(deadline, self.probe.sample(check, ctx)).await {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => return Some(check.clone()),
                Ok(Err(err)) => return Some(format!("{check} ({err})")),
                Err(_) => return Some(format!("{check} (timed out)")),
            }
        }
        None
    }

    fn finish(&self, ctx: &WorkflowContext, result: RollbackResult) -> RollbackResult {
        tracing::info!(
            workflow_id = %ctx.workflow_id,
            status = ?result.status,
            actions_executed = result.actions_executed,
            errors = result.errors.len(),
            timed_out = result.timed_out,
            "rollback finished"
        );
        self.publish(RemediationEvent::RollbackFinished {
            workflow_id: ctx.workflow_id,
            status: result.status,
            actions_executed: result.actions_executed,
        });
        result
    }

    fn publish(&self, event: RemediationEvent) {
        if let Some(events) = self.events {
            events.publish(event);
        }
    }
}

/// Roughly 30 years, the same horizon tokio uses for unbounded timers.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + budget`, saturating to a far-future instant instead of overflowing.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn not_attempted(action: &RollbackAction) -> RollbackActionRecord {
    RollbackActionRecord {
        execution_order: action.execution_order,
        action: action.action,
        status: RollbackActionStatus::NotAttempted,
        error: None,
        attempts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{plan, rollback_action, ScriptedExecutor, ScriptedProbe, Step};
    use remedy_types::plan::ActionKind;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 10,
            max_delay_ms: 10,
            jitter: 0.0,
        }
    }

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(json!({}))
    }

    fn two_action_plan() -> RemediationPlan {
        let mut p = plan(ActionKind::IncreaseResources);
        p.rollback.triggers = vec!["error_rate > 10%".to_string()];
        p.rollback.rollback_actions = vec![
            rollback_action(1, ActionKind::RollbackDeployment, 30),
            rollback_action(2, ActionKind::RestartPod, 30),
        ];
        p
    }

    #[tokio::test(start_paused = true)]
    async fn first_fails_second_succeeds_is_partial() {
        let executor = ScriptedExecutor::new()
            .script("rollback-1", vec![Step::permanent("revision not found")])
            .script("rollback-2", vec![Step::ok(json!({}))]);
        let probe = ScriptedProbe::new();
        let retry = policy();

        let result = RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&two_action_plan(), &ctx(), "error_rate > 10%")
            .await;

        assert_eq!(result.status, RollbackStatus::Partial);
        assert!(!result.success);
        assert_eq!(result.actions_executed, 1);
        assert_eq!(
            result.errors,
            vec!["action 1 (rollback_deployment): revision not found".to_string()]
        );
        assert_eq!(executor.call_order(), vec!["rollback-1", "rollback-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn all_completed_is_success() {
        let executor = ScriptedExecutor::new();
        let probe = ScriptedProbe::new();
        let retry = policy();

        let result = RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&two_action_plan(), &ctx(), "manual")
            .await;
        assert_eq!(result.status, RollbackStatus::Succeeded);
        assert!(result.success);
        assert_eq!(result.actions_executed, 2);
        assert!(result.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeouts_do_not_overflow() {
        let mut p = two_action_plan();
        p.rollback.rollback_timeout_secs = u64::MAX;
        p.rollback.rollback_actions[0].timeout_secs = u64::MAX;
        p.rollback.safety_checks = vec!["replicas_available".to_string()];
        let executor = ScriptedExecutor::new();
        let probe = ScriptedProbe::new().on("replicas_available", vec![true]);
        let retry = policy();

        let result = RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&p, &ctx(), "error_rate > 10%")
            .await;
        assert_eq!(result.status, RollbackStatus::Succeeded);
        assert_eq!(result.actions_executed, 2);
        assert!(!result.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_saturates() {
        let before = Instant::now();
        assert!(deadline_after(Duration::MAX) > before + Duration::from_secs(86_400 * 365));
        assert_eq!(deadline_after(Duration::ZERO), before);
    }

    #[tokio::test(start_paused = true)]
    async fn all_failed_is_failed() {
        let executor = ScriptedExecutor::new()
            .script("rollback-1", vec![Step::permanent("boom")])
            .script("rollback-2", vec![Step::permanent("boom")]);
        let probe = ScriptedProbe::new();
        let retry = policy();

        let result = RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&two_action_plan(), &ctx(), "manual")
            .await;
        assert_eq!(result.status, RollbackStatus::Failed);
        assert_eq!(result.actions_executed, 0);
        assert_eq!(result.errors.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_execution_order_not_declaration_order() {
        let mut p = two_action_plan();
        p.rollback.rollback_actions.reverse();
        let executor = ScriptedExecutor::new();
        let probe = ScriptedProbe::new();
        let retry = policy();

        RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&p, &ctx(), "manual")
            .await;
        assert_eq!(executor.call_order(), vec!["rollback-1", "rollback-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_safety_check_blocks_rollback() {
        let mut p = two_action_plan();
        p.rollback.safety_checks = vec!["replicas_available".to_string(), "no_pdb_violation".to_string()];
        let executor = ScriptedExecutor::new();
        let probe = ScriptedProbe::new()
            .on("replicas_available", vec![true])
            .on("no_pdb_violation", vec![false]);
        let retry = policy();

        let result = RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&p, &ctx(), "manual")
            .await;

        assert_eq!(result.status, RollbackStatus::Blocked);
        assert_eq!(result.actions_executed, 0);
        assert_eq!(result.blocked_by.as_deref(), Some("no_pdb_violation"));
        assert!(result
            .actions
            .iter()
            .all(|a| a.status == RollbackActionStatus::NotAttempted));
        assert!(executor.call_order().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn safety_check_error_blocks_rollback() {
        let mut p = two_action_plan();
        p.rollback.safety_checks = vec!["cluster_reachable".to_string()];
        let executor = ScriptedExecutor::new();
        let probe = ScriptedProbe::new().failing("cluster_reachable");
        let retry = policy();

        let result = RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&p, &ctx(), "manual")
            .await;
        assert_eq!(result.status, RollbackStatus::Blocked);
        assert!(executor.call_order().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_marks_remaining_not_attempted() {
        let mut p = two_action_plan();
        p.rollback.rollback_timeout_secs = 10;
        p.rollback.rollback_actions.push(rollback_action(3, ActionKind::NotifyOnly, 30));
        let executor = ScriptedExecutor::new()
            .script("rollback-1", vec![Step::delayed(Duration::from_secs(60), json!({}))]);
        let probe = ScriptedProbe::new();
        let retry = policy();

        let result = RollbackCoordinator::new(&executor, &probe, &retry)
            .rollback(&p, &ctx(), "manual")
            .await;

        assert!(result.timed_out);
        assert_eq!(result.status, RollbackStatus::Failed);
        let statuses: Vec<_> = result.actions.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![
                RollbackActionStatus::Failed,
                RollbackActionStatus::NotAttempted,
                RollbackActionStatus::NotAttempted
            ]
        );
        assert_eq!(executor.calls("rollback-2"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_start_and_finish() {
        let executor = ScriptedExecutor::new();
        let probe = ScriptedProbe::new();
        let retry = policy();
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        RollbackCoordinator::new(&executor, &probe, &retry)
            .with_events(&bus)
            .rollback(&two_action_plan(), &ctx(), "error_rate > 10%")
            .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            RemediationEvent::RollbackStarted { actions: 2, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            RemediationEvent::RollbackFinished {
                status: RollbackStatus::Succeeded,
                actions_executed: 2,
                ..
            }
        ));
    }
}
