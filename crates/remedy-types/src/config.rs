//! Engine configuration types.
//!
//! `EngineConfig` represents the `engine.toml` that tunes the workflow engine:
//! concurrency, retry policy, rounding, preservation threshold, and the
//! resource budget used by the estimator. All fields have defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the remediation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running steps.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Minimum context preservation rate for a fully compliant workflow.
    #[serde(default = "default_preservation_threshold")]
    pub preservation_threshold: f64,

    /// Run the rollback plan when the workflow ends Failed, even without a
    /// monitor trigger.
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    /// Reject plans whose estimated complexity exceeds this score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_plan_complexity: Option<f64>,

    /// Rounding applied by numeric parameter transforms.
    #[serde(default)]
    pub rounding: RoundingPolicy,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub resources: ResourceBudget,

    /// Capacity of the event bus broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            preservation_threshold: default_preservation_threshold(),
            rollback_on_failure: true,
            max_plan_complexity: None,
            rounding: RoundingPolicy::default(),
            retry: RetryPolicy::default(),
            resources: ResourceBudget::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// The single rounding policy numeric derivations use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    /// Round up to the next multiple of the granularity.
    #[default]
    Ceil,
    /// Round down to the previous multiple of the granularity.
    Floor,
    /// Round to the nearest multiple, halves away from zero.
    Nearest,
}

/// Bounded retry with exponential backoff and jitter for transient errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter, in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Resource budget the estimator allocates step weights against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default = "default_cpu_budget")]
    pub cpu: f64,
    #[serde(default = "default_memory_budget")]
    pub memory: f64,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            cpu: default_cpu_budget(),
            memory: default_memory_budget(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_preservation_threshold() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_cpu_budget() -> f64 {
    4.0
}

fn default_memory_budget() -> f64 {
    8.0
}
