//! Remediation plan types.
//!
//! A `RemediationPlan` is the action plan produced upstream by the AI advisor:
//! one primary action, an ordered list of conditionally-dependent secondary
//! actions, a monitoring plan, and a rollback plan. The engine treats a plan
//! as immutable once accepted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stage id reserved for the primary action.
pub const PRIMARY_STAGE_ID: &str = "primary";

/// Pseudo-stage id that resolves parameter sources from the alert context.
pub const ALERT_STAGE_ID: &str = "alert";

/// Default per-step timeout in seconds when a plan omits one.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Action kinds
// ---------------------------------------------------------------------------

/// The closed set of cluster operations the engine can dispatch.
///
/// Plans naming anything else fail to deserialize, so an unknown action can
/// never reach the executor as a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RestartPod,
    DeletePod,
    ScaleDeployment,
    IncreaseResources,
    RollbackDeployment,
    CordonNode,
    DrainNode,
    UpdateConfigMap,
    CollectDiagnostics,
    NotifyOnly,
}

impl ActionKind {
    /// All action kinds, in declaration order.
    pub const ALL: [ActionKind; 10] = [
        ActionKind::RestartPod,
        ActionKind::DeletePod,
        ActionKind::ScaleDeployment,
        ActionKind::IncreaseResources,
        ActionKind::RollbackDeployment,
        ActionKind::CordonNode,
        ActionKind::DrainNode,
        ActionKind::UpdateConfigMap,
        ActionKind::CollectDiagnostics,
        ActionKind::NotifyOnly,
    ];

    /// The wire name of this action (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RestartPod => "restart_pod",
            ActionKind::DeletePod => "delete_pod",
            ActionKind::ScaleDeployment => "scale_deployment",
            ActionKind::IncreaseResources => "increase_resources",
            ActionKind::RollbackDeployment => "rollback_deployment",
            ActionKind::CordonNode => "cordon_node",
            ActionKind::DrainNode => "drain_node",
            ActionKind::UpdateConfigMap => "update_config_map",
            ActionKind::CollectDiagnostics => "collect_diagnostics",
            ActionKind::NotifyOnly => "notify_only",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown action name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action type: '{0}'")]
pub struct UnknownActionKind(pub String);

impl FromStr for ActionKind {
    type Err = UnknownActionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownActionKind(s.to_string()))
    }
}

/// Urgency the advisor attached to the primary action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// The Kubernetes object an action operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub namespace: String,
    /// Object kind, e.g. `Pod`, `Deployment`, `Node`.
    pub kind: String,
    pub name: String,
}

impl fmt::Display for ActionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// An AI-generated remediation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPlan {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Name of the alert that produced this plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_name: Option<String>,
    /// Advisor confidence, must lie in [0, 1].
    pub confidence: f64,
    /// Default target for every step that does not override it.
    pub target: ActionTarget,
    pub primary_action: PrimaryAction,
    #[serde(default)]
    pub secondary_actions: Vec<SecondaryAction>,
    #[serde(default)]
    pub monitoring: MonitoringPlan,
    #[serde(default)]
    pub rollback: RollbackPlan,
    #[serde(default)]
    pub context_requirements: ContextRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl RemediationPlan {
    /// Action kinds of every executable step (primary, then secondaries).
    pub fn step_actions(&self) -> Vec<ActionKind> {
        std::iter::once(self.primary_action.action)
            .chain(self.secondary_actions.iter().map(|s| s.action))
            .collect()
    }

    /// Every action kind the plan may dispatch, rollback actions included.
    pub fn all_actions(&self) -> Vec<ActionKind> {
        let mut actions = self.step_actions();
        actions.extend(self.rollback.rollback_actions.iter().map(|a| a.action));
        actions
    }

    /// Look up a secondary action by its stage id.
    pub fn secondary(&self, stage_id: &str) -> Option<&SecondaryAction> {
        self.secondary_actions
            .iter()
            .find(|s| s.stage_id() == stage_id)
    }
}

/// The first action executed in every workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryAction {
    pub action: ActionKind,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub urgency: Urgency,
    /// Advisor's estimate of how long the action takes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_secs: Option<u64>,
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    /// Expressions used by the monitor when the monitoring plan declares none.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ActionTarget>,
}

/// Temporal relationship of a secondary action to the primary action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionCondition {
    /// Runs only when the primary action failed.
    IfPrimaryFails,
    /// Runs once the primary action is terminal, whatever its status.
    AfterPrimary,
    /// Starts together with the primary action.
    ParallelWithPrimary,
}

impl fmt::Display for ExecutionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionCondition::IfPrimaryFails => "if_primary_fails",
            ExecutionCondition::AfterPrimary => "after_primary",
            ExecutionCondition::ParallelWithPrimary => "parallel_with_primary",
        })
    }
}

/// A conditionally executed follow-up action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryAction {
    /// Explicit stage id. Defaults to `secondary-<execution_order>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: ActionKind,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub execution_order: u32,
    pub condition: ExecutionCondition,
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    /// Stage ids that must be completed before this step is dispatched.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Rules projecting earlier stage outputs into this step's parameters.
    #[serde(default)]
    pub parameter_rules: Vec<ParameterRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ActionTarget>,
}

impl SecondaryAction {
    /// The stage id used for prerequisites, results, and history.
    pub fn stage_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("secondary-{}", self.execution_order),
        }
    }
}

/// Maps one source value onto one target parameter through a named transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRule {
    #[serde(default = "default_source_stage")]
    pub source_stage: String,
    pub source_parameter: String,
    pub target_parameter: String,
    #[serde(default = "default_transform")]
    pub transform: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Monitoring and rollback
// ---------------------------------------------------------------------------

/// What to observe after execution, and for how long.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringPlan {
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Extra checks that must hold together with the success criteria.
    #[serde(default)]
    pub validation_probes: Vec<String>,
    #[serde(default)]
    pub monitoring_duration_secs: u64,
    #[serde(default)]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,
}

/// Advisory escalation reported when monitoring is inconclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub name: String,
    /// Optional expression; the rule applies unconditionally when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub action: String,
}

/// Compensating actions and the triggers that start them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackPlan {
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub rollback_actions: Vec<RollbackAction>,
    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_secs: u64,
    #[serde(default)]
    pub safety_checks: Vec<String>,
}

/// A single compensating action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAction {
    pub action: ActionKind,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub execution_order: u32,
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ActionTarget>,
}

/// Data the workflow needs at start and must carry to the end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRequirements {
    /// Alert context keys that must be present before execution starts.
    #[serde(default)]
    pub required_data: Vec<String>,
    /// Keys guaranteed to survive every stage transition.
    #[serde(default)]
    pub preservation_keys: Vec<String>,
    /// External systems the plan relies on (informational).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_rollback_timeout() -> u64 {
    600
}

fn default_source_stage() -> String {
    PRIMARY_STAGE_ID.to_string()
}

fn default_transform() -> String {
    "direct_copy".to_string()
}
