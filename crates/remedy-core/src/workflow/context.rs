//! Per-workflow context store.
//!
//! `WorkflowContext` is the mutable state that flows through one workflow
//! instance. It carries the read-mostly inputs (alert context, system state,
//! historical pattern), the execution state every stage updates, and the
//! preserved data that must survive every stage transition.
//!
//! The context is owned by exactly one engine instance. Concurrent step tasks
//! receive clones and hand their results back to the scheduler, which is the
//! single writer.

use std::collections::HashMap;

use remedy_types::execution::StageStatus;
use remedy_types::plan::RemediationPlan;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single stage result (1 MB).
pub const MAX_STAGE_RESULT_SIZE: usize = 1_048_576;

/// Maximum total size of all stage results (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Key inside a stage result payload that explicitly updates preserved data.
pub const CONTEXT_UPDATE_KEY: &str = "context";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to restore context: {0}")]
    Restore(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Recorded outcome of one stage, visible to later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    pub pending_stages: Vec<String>,
    pub stage_results: HashMap<String, StageResult>,
    pub failed_actions: Vec<String>,
    pub successful_actions: Vec<String>,
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    pub alert_context: Value,
    #[serde(default)]
    pub system_state: Value,
    #[serde(default)]
    pub historical_pattern: Value,
    #[serde(default)]
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub preserved_data: HashMap<String, Value>,
    #[serde(default)]
    pub preservation_keys: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl WorkflowContext {
    /// Create a context from the alert payload.
    ///
    /// Non-object payloads are wrapped as `{ "value": <payload> }` so that
    /// every input is addressable by key.
    pub fn new(alert_context: Value) -> Self {
        Self {
            workflow_id: Uuid::now_v7(),
            plan_id: None,
            alert_context: as_object(alert_context),
            system_state: json!({}),
            historical_pattern: json!({}),
            execution_state: ExecutionState::default(),
            preserved_data: HashMap::new(),
            preservation_keys: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_system_state(mut self, system_state: Value) -> Self {
        self.system_state = as_object(system_state);
        self
    }

    pub fn with_historical_pattern(mut self, historical_pattern: Value) -> Self {
        self.historical_pattern = as_object(historical_pattern);
        self
    }

    /// Bind the context to a plan: record ids, queue every stage as pending,
    /// and seed preserved data from the inputs.
    pub fn bind_plan(&mut self, plan: &RemediationPlan) {
        self.plan_id = Some(plan.id);
        self.preservation_keys = plan.context_requirements.preservation_keys.clone();
        self.dependencies = plan.context_requirements.dependencies.clone();

        self.execution_state.pending_stages = std::iter::once(
            remedy_types::plan::PRIMARY_STAGE_ID.to_string(),
        )
        .chain(plan.secondary_actions.iter().map(|s| s.stage_id()))
        .collect();

        for key in &self.preservation_keys {
            if self.preserved_data.contains_key(key) {
                continue;
            }
            if let Some(value) = self.lookup_input(key) {
                self.preserved_data.insert(key.clone(), value);
            }
        }
    }

    /// Find `key` in the alert context, then system state, then history.
    pub fn lookup_input(&self, key: &str) -> Option<Value> {
        [&self.alert_context, &self.system_state, &self.historical_pattern]
            .into_iter()
            .find_map(|source| source.get(key).filter(|v| !v.is_null()).cloned())
    }

    /// Keys from `required` that are absent from every input.
    pub fn missing_required_data(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|key| self.lookup_input(key).is_none())
            .cloned()
            .collect()
    }

    pub fn begin_stage(&mut self, stage_id: &str) {
        self.execution_state.current_stage = Some(stage_id.to_string());
    }

    /// Record a terminal stage outcome.
    ///
    /// Oversized results are replaced with a truncation marker. A result
    /// object carrying a `"context"` object explicitly updates preserved data.
    /// Returns whether every preserved key is still present afterwards.
    pub fn record_stage_result(
        &mut self,
        stage_id: &str,
        action: &str,
        status: StageStatus,
        output: Option<Value>,
        parameters: HashMap<String, Value>,
    ) -> bool {
        let output = output.unwrap_or(Value::Null);

        if let Some(Value::Object(updates)) = output.get(CONTEXT_UPDATE_KEY) {
            for (key, value) in updates {
                if value.is_null() {
                    self.preserved_data.remove(key);
                } else {
                    self.preserved_data.insert(key.clone(), value.clone());
                }
            }
        }

        let size = serialized_size(&output);
        let output = if size > MAX_STAGE_RESULT_SIZE
            || self.total_size() + size > MAX_CONTEXT_SIZE
        {
            tracing::warn!(
                stage_id,
                size,
                max = MAX_STAGE_RESULT_SIZE,
                "stage result exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
            })
        } else {
            output
        };

        let state = &mut self.execution_state;
        state.pending_stages.retain(|s| s != stage_id);
        if state.current_stage.as_deref() == Some(stage_id) {
            state.current_stage = None;
        }
        match status {
            StageStatus::Completed => {
                state.completed_stages.push(stage_id.to_string());
                state.successful_actions.push(action.to_string());
            }
            StageStatus::Failed => state.failed_actions.push(action.to_string()),
            _ => {}
        }
        state.stage_results.insert(
            stage_id.to_string(),
            StageResult {
                status,
                output,
                parameters,
            },
        );

        self.preserved_keys_intact()
    }

    /// Whether `stage_id` completed and its result is visible.
    pub fn is_completed(&self, stage_id: &str) -> bool {
        self.execution_state
            .completed_stages
            .iter()
            .any(|s| s == stage_id)
    }

    pub fn stage_result(&self, stage_id: &str) -> Option<&StageResult> {
        self.execution_state.stage_results.get(stage_id)
    }

    pub fn stage_status(&self, stage_id: &str) -> Option<StageStatus> {
        self.stage_result(stage_id).map(|r| r.status)
    }

    /// Resolve a parameter from a stage: its output first, then the
    /// parameters it ran with.
    pub fn stage_value(&self, stage_id: &str, parameter: &str) -> Option<Value> {
        let result = self.stage_result(stage_id)?;
        result
            .output
            .get(parameter)
            .filter(|v| !v.is_null())
            .or_else(|| result.parameters.get(parameter))
            .cloned()
    }

    /// Whether every preservation key currently holds a non-null value.
    pub fn preserved_keys_intact(&self) -> bool {
        self.preservation_keys
            .iter()
            .all(|key| self.preserved_data.get(key).is_some_and(|v| !v.is_null()))
    }

    /// Exact preservation rate: found keys divided by required keys.
    ///
    /// Returns 1.0 when no keys are required.
    pub fn preservation_rate(&self) -> f64 {
        if self.preservation_keys.is_empty() {
            return 1.0;
        }
        let found = self
            .preservation_keys
            .iter()
            .filter(|key| self.preserved_data.get(*key).is_some_and(|v| !v.is_null()))
            .count();
        found as f64 / self.preservation_keys.len() as f64
    }

    /// Total serialized size of all stage results in bytes.
    pub fn total_size(&self) -> usize {
        self.execution_state
            .stage_results
            .values()
            .map(|r| serialized_size(&r.output))
            .sum()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Build the JSON view expressions are evaluated against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "alert": { ... }, "system": { ... }, "history": { ... },
    ///   "preserved": { ... },
    ///   "stages": { "<stage_id>": { "status": "completed", "result": <value> } },
    ///   "workflow": { "id": "...", "completed": [...], "failed_actions": [...] }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut stages = Map::new();
        for (id, result) in &self.execution_state.stage_results {
            stages.insert(
                id.clone(),
                json!({ "status": result.status.as_str(), "result": result.output }),
            );
        }

        json!({
            "alert": self.alert_context,
            "system": self.system_state,
            "history": self.historical_pattern,
            "preserved": self.preserved_data,
            "stages": stages,
            "workflow": {
                "id": self.workflow_id.to_string(),
                "completed": self.execution_state.completed_stages,
                "failed_actions": self.execution_state.failed_actions,
            }
        })
    }
}

fn as_object(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Null => json!({}),
        other => json!({ "value": other }),
    }
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
