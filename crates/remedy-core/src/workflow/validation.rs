//! Structural plan validation.
//!
//! Runs before anything is dispatched. Every violation is collected so the
//! upstream advisor sees the full list in one rejection.

use std::collections::HashSet;

use remedy_types::config::EngineConfig;
use remedy_types::plan::{
    ActionKind, ExecutionCondition, RemediationPlan, ALERT_STAGE_ID, PRIMARY_STAGE_ID,
};

use super::context::WorkflowContext;
use super::dag::validate_step_graph;
use super::estimator::ResourceEstimator;
use super::expression::ConditionEvaluator;

/// A rejected plan, with every violation found.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("plan validation failed: {}", .violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

/// Validate `plan` against the executor's capabilities, the initial context,
/// and the engine configuration.
///
/// Checks:
/// - confidence lies in [0, 1] and the target is fully named
/// - step timeouts are non-zero
/// - secondary `execution_order` strictly increases; stage ids are unique and
///   do not shadow `primary` or `alert`
/// - prerequisites name known stages, form no cycle, and are absent on
///   `parallel_with_primary` steps
/// - monitoring with anything to evaluate has a non-zero check interval
/// - rollback action orders strictly increase and timeouts are non-zero;
///   triggers come with at least one rollback action
/// - every action is supported by the executor
/// - required context data is present
/// - every expression parses
/// - the complexity score stays under `max_plan_complexity`, if configured
pub fn validate_plan(
    plan: &RemediationPlan,
    ctx: &WorkflowContext,
    supported: &[ActionKind],
    config: &EngineConfig,
) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    if !(0.0..=1.0).contains(&plan.confidence) {
        violations.push(format!(
            "confidence {} is outside [0, 1]",
            plan.confidence
        ));
    }
    for (field, value) in [
        ("namespace", &plan.target.namespace),
        ("kind", &plan.target.kind),
        ("name", &plan.target.name),
    ] {
        if value.trim().is_empty() {
            violations.push(format!("target {field} must not be empty"));
        }
    }

    if plan.primary_action.timeout_secs == 0 {
        violations.push("primary action timeout must be > 0".to_string());
    }

    // Secondaries
    let mut seen = HashSet::new();
    let mut last_order: Option<u32> = None;
    for step in &plan.secondary_actions {
        let stage = step.stage_id();
        if stage == PRIMARY_STAGE_ID || stage == ALERT_STAGE_ID {
            violations.push(format!("stage id '{stage}' is reserved"));
        }
        if !seen.insert(stage.clone()) {
            violations.push(format!("duplicate stage id '{stage}'"));
        }
        if let Some(prev) = last_order {
            if step.execution_order <= prev {
                violations.push(format!(
                    "execution_order {} of '{stage}' does not increase (previous {prev})",
                    step.execution_order
                ));
            }
        }
        last_order = Some(step.execution_order);

        if step.timeout_secs == 0 {
            violations.push(format!("timeout of '{stage}' must be > 0"));
        }
        if step.condition == ExecutionCondition::ParallelWithPrimary && !step.prerequisites.is_empty()
        {
            violations.push(format!(
                "'{stage}' runs parallel_with_primary and cannot declare prerequisites"
            ));
        }
        if step.prerequisites.iter().any(|p| p == &stage) {
            violations.push(format!("'{stage}' lists itself as a prerequisite"));
        }
    }
    if let Err(err) = validate_step_graph(plan) {
        violations.push(err.to_string());
    }

    // Monitoring
    let monitoring = &plan.monitoring;
    let evaluates_anything = !monitoring.success_criteria.is_empty()
        || !monitoring.validation_probes.is_empty()
        || !plan.primary_action.success_criteria.is_empty()
        || !plan.rollback.triggers.is_empty();
    if evaluates_anything && monitoring.check_interval_secs == 0 {
        violations.push("monitoring check_interval must be > 0".to_string());
    }

    // Rollback
    let mut last_order: Option<u32> = None;
    for action in &plan.rollback.rollback_actions {
        if let Some(prev) = last_order {
            if action.execution_order <= prev {
                violations.push(format!(
                    "rollback execution_order {} does not increase (previous {prev})",
                    action.execution_order
                ));
            }
        }
        last_order = Some(action.execution_order);
        if action.timeout_secs == 0 {
            violations.push(format!(
                "timeout of rollback action {} must be > 0",
                action.execution_order
            ));
        }
    }
    if !plan.rollback.rollback_actions.is_empty() && plan.rollback.rollback_timeout_secs == 0 {
        violations.push("rollback_timeout must be > 0".to_string());
    }
    if !plan.rollback.triggers.is_empty() && plan.rollback.rollback_actions.is_empty() {
        violations.push("rollback triggers are declared without rollback actions".to_string());
    }

    // Executor capabilities
    let mut unsupported: Vec<ActionKind> = Vec::new();
    for action in plan.all_actions() {
        if !supported.contains(&action) && !unsupported.contains(&action) {
            unsupported.push(action);
        }
    }
    for action in unsupported {
        violations.push(format!("action '{action}' is not supported by the executor"));
    }

    // Context
    for key in ctx.missing_required_data(&plan.context_requirements.required_data) {
        violations.push(format!("required context data '{key}' is missing"));
    }

    // Expressions
    let evaluator = ConditionEvaluator::new();
    let expressions = plan
        .primary_action
        .success_criteria
        .iter()
        .chain(&monitoring.success_criteria)
        .chain(&monitoring.validation_probes)
        .chain(monitoring.escalation_rules.iter().filter_map(|r| r.condition.as_ref()))
        .chain(&plan.rollback.triggers)
        .chain(&plan.rollback.safety_checks);
    for expr in expressions {
        if let Err(err) = evaluator.validate(expr) {
            violations.push(format!("expression '{expr}' is invalid: {err}"));
        }
    }

    // Complexity gate
    if let Some(max) = config.max_plan_complexity {
        let estimator = ResourceEstimator::new(config.resources.clone(), config.max_concurrency);
        let score = estimator
            .estimate_complexity(&plan.step_actions())
            .overall_score;
        if score > max {
            violations.push(format!(
                "plan complexity {score:.2} exceeds the configured maximum {max:.2}"
            ));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}
