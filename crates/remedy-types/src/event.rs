//! Events published by the remediation engine.
//!
//! Audit and notification consumers subscribe to these through the event bus.
//! `WorkflowFinished` is the structured result record: metrics, the full stage
//! history, and the final context snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::{
    ExecutionMetrics, FailureCause, MonitoringOutcome, RollbackStatus, StageExecution,
    WorkflowOutcome,
};
use crate::plan::ActionKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemediationEvent {
    WorkflowStarted {
        workflow_id: Uuid,
        plan_id: Uuid,
        total_stages: usize,
    },
    StageStarted {
        workflow_id: Uuid,
        stage_id: String,
        action: ActionKind,
    },
    StageCompleted {
        workflow_id: Uuid,
        stage_id: String,
        duration_ms: u64,
        attempts: u32,
    },
    StageFailed {
        workflow_id: Uuid,
        stage_id: String,
        cause: FailureCause,
        error: String,
    },
    StageSkipped {
        workflow_id: Uuid,
        stage_id: String,
        reason: String,
    },
    ParameterFlowDegraded {
        workflow_id: Uuid,
        source_stage: String,
        target_stage: String,
        failed_rules: usize,
    },
    MonitoringTick {
        workflow_id: Uuid,
        tick: u32,
        criteria_met: bool,
        trigger_fired: bool,
    },
    MonitoringFinished {
        workflow_id: Uuid,
        outcome: MonitoringOutcome,
        ticks: u32,
    },
    RollbackStarted {
        workflow_id: Uuid,
        trigger: String,
        actions: usize,
    },
    RollbackFinished {
        workflow_id: Uuid,
        status: RollbackStatus,
        actions_executed: usize,
    },
    WorkflowFinished {
        workflow_id: Uuid,
        outcome: WorkflowOutcome,
        metrics: ExecutionMetrics,
        stages: Vec<StageExecution>,
        context: Value,
    },
}

impl RemediationEvent {
    /// The workflow this event belongs to.
    pub fn workflow_id(&self) -> Uuid {
        match self {
            RemediationEvent::WorkflowStarted { workflow_id, .. }
            | RemediationEvent::StageStarted { workflow_id, .. }
            | RemediationEvent::StageCompleted { workflow_id, .. }
            | RemediationEvent::StageFailed { workflow_id, .. }
            | RemediationEvent::StageSkipped { workflow_id, .. }
            | RemediationEvent::ParameterFlowDegraded { workflow_id, .. }
            | RemediationEvent::MonitoringTick { workflow_id, .. }
            | RemediationEvent::MonitoringFinished { workflow_id, .. }
            | RemediationEvent::RollbackStarted { workflow_id, .. }
            | RemediationEvent::RollbackFinished { workflow_id, .. }
            | RemediationEvent::WorkflowFinished { workflow_id, .. } => *workflow_id,
        }
    }
}
