//! Parameter flow engine: projects one stage's output into a later stage's
//! input parameters through named transformation rules.
//!
//! Every rule is logged, applied or not. A transition succeeds only if every
//! declared target parameter was produced; a partial projection is a flow
//! failure, reported but never fatal. Unknown transform names fail closed.

use std::collections::{BTreeMap, HashMap};

use remedy_types::config::RoundingPolicy;
use remedy_types::execution::{ParameterFlow, TransformationLogEntry};
use remedy_types::plan::{ParameterRule, ALERT_STAGE_ID};
use serde_json::Value;

use super::context::WorkflowContext;
use super::quantity::{number_value, round_to, Quantity};

/// Default utilization parameter consulted by `increase_by_utilization`.
pub const DEFAULT_UTILIZATION_SOURCE: &str = "utilization";

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// The named transforms a rule may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Copy the source value unchanged.
    DirectCopy,
    /// `value × factor`, rounded.
    Multiply,
    /// `value + amount`, rounded.
    Add,
    /// `value × (1 + utilization / 100)`, rounded.
    IncreaseByUtilization,
    /// `value × factor` as an integer replica count, capped by `max_replicas`.
    ScaleReplicas,
    /// Render the source value as a string.
    ToString,
}

impl Transform {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "direct_copy" => Some(Transform::DirectCopy),
            "multiply" => Some(Transform::Multiply),
            "add" => Some(Transform::Add),
            "increase_by_utilization" => Some(Transform::IncreaseByUtilization),
            "scale_replicas" => Some(Transform::ScaleReplicas),
            "to_string" => Some(Transform::ToString),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("source parameter '{parameter}' not found in stage '{stage}'")]
    MissingSource { stage: String, parameter: String },

    #[error("value {0} is not a numeric quantity")]
    NotNumeric(Value),

    #[error("missing or invalid argument '{0}'")]
    InvalidArgument(String),
}

// ---------------------------------------------------------------------------
// ParameterFlowEngine
// ---------------------------------------------------------------------------

/// Stateless rule applier configured with the engine's rounding policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterFlowEngine {
    rounding: RoundingPolicy,
}

impl ParameterFlowEngine {
    pub fn new(rounding: RoundingPolicy) -> Self {
        Self { rounding }
    }

    pub fn rounding(&self) -> RoundingPolicy {
        self.rounding
    }

    /// Apply `rules` reading from `source_stage` into `target_stage`.
    ///
    /// `source_stage` may be a stage id or `alert` for the alert context.
    pub fn apply(
        &self,
        source_stage: &str,
        target_stage: &str,
        rules: &[ParameterRule],
        ctx: &WorkflowContext,
    ) -> ParameterFlow {
        let mut parameters = HashMap::new();
        let mut log = Vec::with_capacity(rules.len());

        for rule in rules {
            let input = lookup_source(ctx, source_stage, &rule.source_parameter);
            let outcome = match &input {
                Some(value) => self.transform(rule, source_stage, value, ctx),
                None => Err(TransformError::MissingSource {
                    stage: source_stage.to_string(),
                    parameter: rule.source_parameter.clone(),
                }),
            };

            match outcome {
                Ok(output) => {
                    log.push(TransformationLogEntry {
                        source_parameter: rule.source_parameter.clone(),
                        target_parameter: rule.target_parameter.clone(),
                        transform: rule.transform.clone(),
                        input: input.clone(),
                        output: Some(output.clone()),
                        applied: true,
                        description: format!(
                            "{}.{} -> {}.{} via {}",
                            source_stage,
                            rule.source_parameter,
                            target_stage,
                            rule.target_parameter,
                            rule.transform
                        ),
                    });
                    parameters.insert(rule.target_parameter.clone(), output);
                }
                Err(err) => {
                    tracing::warn!(
                        source_stage,
                        target_stage,
                        target_parameter = rule.target_parameter.as_str(),
                        error = %err,
                        "parameter rule failed"
                    );
                    log.push(TransformationLogEntry {
                        source_parameter: rule.source_parameter.clone(),
                        target_parameter: rule.target_parameter.clone(),
                        transform: rule.transform.clone(),
                        input,
                        output: None,
                        applied: false,
                        description: format!(
                            "failed to produce {}.{}: {}",
                            target_stage, rule.target_parameter, err
                        ),
                    });
                }
            }
        }

        let flow_success = rules
            .iter()
            .all(|rule| parameters.contains_key(&rule.target_parameter));

        ParameterFlow {
            source_stage: source_stage.to_string(),
            target_stage: target_stage.to_string(),
            parameters,
            transformation_log: log,
            flow_success,
        }
    }

    /// Apply a step's rules grouped by source stage, one flow per transition.
    ///
    /// Sources are visited in sorted order so the history is deterministic.
    pub fn flows_for_step(
        &self,
        target_stage: &str,
        rules: &[ParameterRule],
        ctx: &WorkflowContext,
    ) -> Vec<ParameterFlow> {
        let mut by_source: BTreeMap<&str, Vec<ParameterRule>> = BTreeMap::new();
        for rule in rules {
            by_source
                .entry(rule.source_stage.as_str())
                .or_default()
                .push(rule.clone());
        }
        by_source
            .into_iter()
            .map(|(source, rules)| self.apply(source, target_stage, &rules, ctx))
            .collect()
    }

    fn transform(
        &self,
        rule: &ParameterRule,
        source_stage: &str,
        value: &Value,
        ctx: &WorkflowContext,
    ) -> Result<Value, TransformError> {
        let transform = Transform::from_name(&rule.transform)
            .ok_or_else(|| TransformError::UnknownTransform(rule.transform.clone()))?;
        let granularity = optional_number(&rule.args, "granularity")?.unwrap_or(1.0);

        match transform {
            Transform::DirectCopy => Ok(value.clone()),
            Transform::ToString => Ok(Value::String(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            Transform::Multiply => {
                let factor = required_number(&rule.args, "factor")?;
                let quantity = quantity(value)?;
                let next = round_to(quantity.value * factor, granularity, self.rounding);
                Ok(quantity.with_value(next).to_value())
            }
            Transform::Add => {
                let amount = required_number(&rule.args, "amount")?;
                let quantity = quantity(value)?;
                let next = round_to(quantity.value + amount, granularity, self.rounding);
                Ok(quantity.with_value(next).to_value())
            }
            Transform::IncreaseByUtilization => {
                let source = match rule.args.get("utilization_source") {
                    Some(Value::String(s)) => s.as_str(),
                    Some(_) => {
                        return Err(TransformError::InvalidArgument(
                            "utilization_source".to_string(),
                        ));
                    }
                    None => DEFAULT_UTILIZATION_SOURCE,
                };
                let utilization = lookup_source(ctx, source_stage, source)
                    .or_else(|| ctx.lookup_input(source))
                    .ok_or_else(|| TransformError::MissingSource {
                        stage: source_stage.to_string(),
                        parameter: source.to_string(),
                    })?;
                let utilization = quantity(&utilization)?.value.max(0.0);
                let quantity = quantity(value)?;
                let next = round_to(
                    quantity.value * (1.0 + utilization / 100.0),
                    granularity,
                    self.rounding,
                );
                Ok(quantity.with_value(next).to_value())
            }
            Transform::ScaleReplicas => {
                let factor = optional_number(&rule.args, "factor")?.unwrap_or(2.0);
                let current = quantity(value)?.value;
                let mut next = round_to(current * factor, 1.0, self.rounding);
                if let Some(max) = optional_number(&rule.args, "max_replicas")? {
                    next = next.min(max);
                }
                Ok(number_value(next.max(0.0)))
            }
        }
    }
}

fn lookup_source(ctx: &WorkflowContext, stage: &str, parameter: &str) -> Option<Value> {
    if stage == ALERT_STAGE_ID {
        ctx.lookup_input(parameter)
    } else {
        ctx.stage_value(stage, parameter)
    }
}

fn quantity(value: &Value) -> Result<Quantity, TransformError> {
    Quantity::parse(value).ok_or_else(|| TransformError::NotNumeric(value.clone()))
}

fn optional_number(
    args: &HashMap<String, Value>,
    name: &str,
) -> Result<Option<f64>, TransformError> {
    match args.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| TransformError::InvalidArgument(name.to_string())),
    }
}

fn required_number(args: &HashMap<String, Value>, name: &str) -> Result<f64, TransformError> {
    optional_number(args, name)?.ok_or_else(|| TransformError::InvalidArgument(name.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
