//! Execution tracking types: stage history, parameter flows, metrics,
//! monitoring reports, rollback results, and terminal workflow outcomes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{ActionKind, ExecutionCondition};

// ---------------------------------------------------------------------------
// Stage history
// ---------------------------------------------------------------------------

/// Status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Whether the stage has reached a final status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

/// Why a stage failed. Timeouts are never conflated with business failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The step's hard deadline elapsed.
    Timeout,
    /// The action executor reported an error.
    ActionError,
    /// The workflow was cancelled while the step was running.
    Cancelled,
}

/// Failure detail attached to a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub cause: FailureCause,
    pub message: String,
}

/// Append-only record of one attempted stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage_id: String,
    pub action: ActionKind,
    /// 0 for the primary action, `execution_order` for secondaries.
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: StageStatus,
    /// Parameters the action was dispatched with.
    pub parameters: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The secondary's declared condition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ExecutionCondition>,
    /// Whether the condition held when evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_met: Option<bool>,
    pub context_preserved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Executor attempts made (0 when never dispatched).
    pub attempts: u32,
}

impl StageExecution {
    /// A stage that was never dispatched.
    pub fn skipped(
        stage_id: impl Into<String>,
        action: ActionKind,
        order: u32,
        condition: Option<ExecutionCondition>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            action,
            order,
            started_at: None,
            ended_at: None,
            status: StageStatus::Skipped,
            parameters: HashMap::new(),
            result: None,
            condition,
            condition_met: None,
            context_preserved: true,
            failure: None,
            skip_reason: Some(reason.into()),
            attempts: 0,
        }
    }

    /// Duration between start and end, when both are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.cause == FailureCause::Timeout)
    }
}

// ---------------------------------------------------------------------------
// Parameter flow
// ---------------------------------------------------------------------------

/// Audit entry for one applied (or failed) transformation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationLogEntry {
    pub source_parameter: String,
    pub target_parameter: String,
    pub transform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub applied: bool,
    /// Human-readable description of what happened.
    pub description: String,
}

/// Result of projecting one stage's output into another stage's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterFlow {
    pub source_stage: String,
    pub target_stage: String,
    /// Parameters produced by successful rules.
    pub parameters: HashMap<String, Value>,
    pub transformation_log: Vec<TransformationLogEntry>,
    /// True only when every declared target parameter was produced.
    pub flow_success: bool,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Incrementally updated workflow metrics, frozen at a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_stages: usize,
    pub completed_stages: usize,
    pub failed_stages: usize,
    pub skipped_stages: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// False once any parameter flow failed.
    pub parameter_flow_success: bool,
    /// Whether the preservation rate met the configured threshold.
    pub context_preservation: bool,
    pub preservation_rate: f64,
    pub monitoring_active: bool,
    pub rollback_triggered: bool,
    frozen: bool,
}

impl ExecutionMetrics {
    /// Start metrics for a workflow with `total_stages` executable steps.
    pub fn start(total_stages: usize) -> Self {
        Self {
            total_stages,
            completed_stages: 0,
            failed_stages: 0,
            skipped_stages: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            parameter_flow_success: true,
            context_preservation: true,
            preservation_rate: 1.0,
            monitoring_active: false,
            rollback_triggered: false,
            frozen: false,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Count a stage that reached a terminal status. No-op once frozen.
    pub fn record_stage(&mut self, status: StageStatus) {
        if self.frozen {
            return;
        }
        match status {
            StageStatus::Completed => self.completed_stages += 1,
            StageStatus::Failed => self.failed_stages += 1,
            StageStatus::Skipped => self.skipped_stages += 1,
            StageStatus::Pending | StageStatus::Running => {}
        }
    }

    pub fn record_flow(&mut self, flow_success: bool) {
        if !self.frozen && !flow_success {
            self.parameter_flow_success = false;
        }
    }

    pub fn set_monitoring_active(&mut self, active: bool) {
        if !self.frozen {
            self.monitoring_active = active;
        }
    }

    pub fn set_rollback_triggered(&mut self, triggered: bool) {
        if !self.frozen {
            self.rollback_triggered = triggered;
        }
    }

    /// Freeze the metrics with the final preservation figures.
    pub fn finalize(&mut self, preservation_rate: f64, threshold: f64) {
        if self.frozen {
            return;
        }
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.preservation_rate = preservation_rate;
        self.context_preservation = preservation_rate >= threshold;
        self.frozen = true;
    }
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

/// Terminal outcome of the dynamic monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitoringOutcome {
    /// Every success criterion held on one sample.
    Succeeded,
    /// A rollback trigger evaluated true.
    RollbackTriggered { trigger: String },
    /// The duration budget ran out with neither success nor a trigger.
    Inconclusive { escalations: Vec<String> },
    Cancelled,
    /// There was nothing to evaluate.
    Skipped,
}

/// One monitoring sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSample {
    pub tick: u32,
    pub at: DateTime<Utc>,
    /// Criterion or trigger expression -> sampled value.
    pub criteria: HashMap<String, bool>,
    pub triggers: HashMap<String, bool>,
}

/// Report produced by one monitoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub outcome: MonitoringOutcome,
    pub ticks: u32,
    pub max_ticks: u32,
    pub samples: Vec<MonitoringSample>,
    pub probe_errors: u32,
}

impl MonitoringReport {
    pub fn skipped() -> Self {
        Self {
            outcome: MonitoringOutcome::Skipped,
            ticks: 0,
            max_ticks: 0,
            samples: Vec::new(),
            probe_errors: 0,
        }
    }

    pub fn rollback_triggered(&self) -> bool {
        matches!(self.outcome, MonitoringOutcome::RollbackTriggered { .. })
    }
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Overall status of a rollback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Every compensating action completed.
    Succeeded,
    /// Some, but not all, compensating actions completed.
    Partial,
    /// No compensating action completed.
    Failed,
    /// A safety check failed; nothing was attempted.
    Blocked,
}

/// Status of one compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackActionStatus {
    Completed,
    Failed,
    /// The rollback deadline was hit before this action started.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackActionRecord {
    pub execution_order: u32,
    pub action: ActionKind,
    pub status: RollbackActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

/// Result of one rollback run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub status: RollbackStatus,
    /// True only for a full rollback.
    pub success: bool,
    /// Number of compensating actions that completed.
    pub actions_executed: usize,
    pub errors: Vec<String>,
    pub actions: Vec<RollbackActionRecord>,
    pub timed_out: bool,
    /// The safety check that blocked the rollback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    /// What started the rollback (trigger expression or step failure).
    pub trigger: String,
}

// ---------------------------------------------------------------------------
// Workflow outcome
// ---------------------------------------------------------------------------

/// Every terminal outcome a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed,
    Failed,
    /// A rollback ran and every compensating action completed.
    RolledBack,
    /// A rollback was required but did not fully complete.
    PartiallyRolledBack,
    Cancelled,
    /// The plan was rejected before anything executed.
    ValidationRejected,
}

impl WorkflowOutcome {
    /// Outcomes that leave the cluster in a state needing human follow-up.
    pub fn requires_attention(&self) -> bool {
        matches!(
            self,
            WorkflowOutcome::Failed | WorkflowOutcome::PartiallyRolledBack
        )
    }
}
