//! Scripted executor, scripted probe, and plan builders for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use remedy_types::plan::{
    ActionKind, ActionTarget, ExecutionCondition, MonitoringPlan, PrimaryAction, RemediationPlan,
    RollbackAction, SecondaryAction,
};
use serde_json::{json, Value};
use uuid::Uuid;

use super::action::{ActionError, ActionExecutor, ActionRequest};
use super::context::WorkflowContext;
use super::probe::{Probe, ProbeError};

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// One scripted response of the executor.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Value),
    Transient(String),
    Permanent(String),
    Delayed(Duration, Box<Step>),
}

impl Step {
    pub fn ok(output: Value) -> Self {
        Step::Ok(output)
    }

    pub fn transient(msg: &str) -> Self {
        Step::Transient(msg.to_string())
    }

    pub fn permanent(msg: &str) -> Self {
        Step::Permanent(msg.to_string())
    }

    pub fn delayed(delay: Duration, output: Value) -> Self {
        Step::Delayed(delay, Box::new(Step::Ok(output)))
    }

    pub fn delayed_failure(delay: Duration, msg: &str) -> Self {
        Step::Delayed(delay, Box::new(Step::permanent(msg)))
    }
}

/// Executor that replays scripted responses per stage id.
///
/// Each call pops the next step; the last step repeats. Unscripted stages
/// succeed with `{}`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    log: Mutex<Vec<ActionRequest>>,
    supported: Option<Vec<ActionKind>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, stage_id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(stage_id.to_string(), steps.into());
        self
    }

    pub fn with_supported(mut self, supported: Vec<ActionKind>) -> Self {
        self.supported = Some(supported);
        self
    }

    /// Number of dispatches made for `stage_id`.
    pub fn calls(&self, stage_id: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.stage_id == stage_id)
            .count()
    }

    /// Stage ids in dispatch order, one entry per attempt.
    pub fn call_order(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.stage_id.clone())
            .collect()
    }

    /// The last request made for `stage_id`.
    pub fn last_request(&self, stage_id: &str) -> Option<ActionRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.stage_id == stage_id)
            .cloned()
    }

    fn next_step(&self, stage_id: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(stage_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Step::Ok(json!({}))),
            Some(queue) => queue.front().cloned().unwrap_or(Step::Ok(json!({}))),
            None => Step::Ok(json!({})),
        }
    }
}

impl ActionExecutor for ScriptedExecutor {
    fn supported_actions(&self) -> Vec<ActionKind> {
        self.supported
            .clone()
            .unwrap_or_else(|| ActionKind::ALL.to_vec())
    }

    async fn execute(&self, request: ActionRequest) -> Result<Value, ActionError> {
        let step = self.next_step(&request.stage_id);
        self.log.lock().unwrap().push(request);

        let step = match step {
            Step::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                *inner
            }
            other => other,
        };
        match step {
            Step::Ok(output) => Ok(output),
            Step::Transient(msg) => Err(ActionError::Transient(msg)),
            Step::Permanent(msg) => Err(ActionError::Permanent(msg)),
            Step::Delayed(..) => Err(ActionError::Permanent("nested delay".to_string())),
        }
    }
}

pub fn request(stage_id: &str) -> ActionRequest {
    ActionRequest {
        workflow_id: Uuid::now_v7(),
        stage_id: stage_id.to_string(),
        action: ActionKind::RestartPod,
        target: target(),
        parameters: HashMap::new(),
        attempt: 1,
    }
}

// ---------------------------------------------------------------------------
// ScriptedProbe
// ---------------------------------------------------------------------------

/// Probe answering from per-criterion sequences; the last answer repeats.
/// Unscripted criteria evaluate false.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    answers: Mutex<HashMap<String, VecDeque<Result<bool, ProbeError>>>>,
    samples: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, criterion: &str, answers: Vec<bool>) -> Self {
        self.answers.lock().unwrap().insert(
            criterion.to_string(),
            answers.into_iter().map(Ok).collect(),
        );
        self
    }

    pub fn failing(self, criterion: &str) -> Self {
        self.answers.lock().unwrap().insert(
            criterion.to_string(),
            VecDeque::from([Err(ProbeError::Unavailable("metrics backend down".to_string()))]),
        );
        self
    }

    /// Times `criterion` was sampled.
    pub fn samples(&self, criterion: &str) -> usize {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == criterion)
            .count()
    }
}

impl Probe for ScriptedProbe {
    async fn sample(&self, criterion: &str, _ctx: &WorkflowContext) -> Result<bool, ProbeError> {
        self.samples.lock().unwrap().push(criterion.to_string());
        let mut answers = self.answers.lock().unwrap();
        match answers.get_mut(criterion) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Ok(false)),
            Some(queue) => queue.front().cloned().unwrap_or(Ok(false)),
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan builders
// ---------------------------------------------------------------------------

pub fn target() -> ActionTarget {
    ActionTarget {
        namespace: "payments".to_string(),
        kind: "Deployment".to_string(),
        name: "api".to_string(),
    }
}

pub fn plan(primary: ActionKind) -> RemediationPlan {
    RemediationPlan {
        id: Uuid::now_v7(),
        alert_name: Some("PodCrashLooping".to_string()),
        confidence: 0.85,
        target: target(),
        primary_action: PrimaryAction {
            action: primary,
            parameters: HashMap::new(),
            urgency: Default::default(),
            expected_duration_secs: None,
            timeout_secs: 30,
            success_criteria: vec![],
            target: None,
        },
        secondary_actions: vec![],
        monitoring: MonitoringPlan::default(),
        rollback: Default::default(),
        context_requirements: Default::default(),
        reasoning: None,
    }
}

pub fn secondary(order: u32, action: ActionKind, condition: ExecutionCondition) -> SecondaryAction {
    SecondaryAction {
        id: None,
        action,
        parameters: HashMap::new(),
        execution_order: order,
        condition,
        timeout_secs: 30,
        prerequisites: vec![],
        parameter_rules: vec![],
        target: None,
    }
}

pub fn rollback_action(order: u32, action: ActionKind, timeout_secs: u64) -> RollbackAction {
    RollbackAction {
        action,
        parameters: HashMap::new(),
        execution_order: order,
        timeout_secs,
        target: None,
    }
}

pub fn monitoring(criteria: &[&str], duration_secs: u64, interval_secs: u64) -> MonitoringPlan {
    MonitoringPlan {
        success_criteria: criteria.iter().map(|c| c.to_string()).collect(),
        validation_probes: vec![],
        monitoring_duration_secs: duration_secs,
        check_interval_secs: interval_secs,
        escalation_rules: vec![],
    }
}
