//! Resource and complexity estimation for plan acceptance and concurrency.
//!
//! Every action kind carries a static profile: a complexity score in [0, 1]
//! and relative CPU/memory weights. The scheduler bounds its worker pool with
//! `allocate_resources`; callers may gate plan acceptance on
//! `estimate_complexity`.

use remedy_types::config::ResourceBudget;
use remedy_types::plan::ActionKind;
use serde::{Deserialize, Serialize};

/// Static cost profile of one action kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionProfile {
    pub complexity: f64,
    pub cpu_weight: f64,
    pub memory_weight: f64,
}

pub fn action_profile(kind: ActionKind) -> ActionProfile {
    let (complexity, cpu_weight, memory_weight) = match kind {
        ActionKind::NotifyOnly => (0.0, 0.1, 0.1),
        ActionKind::CollectDiagnostics => (0.1, 0.3, 0.3),
        ActionKind::RestartPod => (0.2, 0.5, 0.5),
        ActionKind::DeletePod => (0.2, 0.3, 0.3),
        ActionKind::CordonNode => (0.3, 0.2, 0.2),
        ActionKind::ScaleDeployment => (0.4, 1.0, 1.0),
        ActionKind::UpdateConfigMap => (0.4, 0.2, 0.2),
        ActionKind::IncreaseResources => (0.5, 1.5, 2.0),
        ActionKind::RollbackDeployment => (0.7, 1.0, 1.0),
        ActionKind::DrainNode => (0.9, 2.0, 2.0),
    };
    ActionProfile {
        complexity,
        cpu_weight,
        memory_weight,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    /// Overall score in [0, 1].
    pub overall_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub total_cpu_weight: f64,
    pub total_memory_weight: f64,
    pub max_concurrency: usize,
    /// Average occupancy of the concurrency slots, in [0, 1].
    pub efficiency_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEstimator {
    budget: ResourceBudget,
    concurrency_limit: usize,
}

impl ResourceEstimator {
    pub fn new(budget: ResourceBudget, concurrency_limit: usize) -> Self {
        Self {
            budget,
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    /// `min(1, 0.7 × mean complexity + 0.3 × min(n, 10) / 10)`; 0 when empty.
    pub fn estimate_complexity(&self, steps: &[ActionKind]) -> ComplexityEstimate {
        if steps.is_empty() {
            return ComplexityEstimate { overall_score: 0.0 };
        }
        let n = steps.len() as f64;
        let mean = steps
            .iter()
            .map(|k| action_profile(*k).complexity)
            .sum::<f64>()
            / n;
        let breadth = steps.len().min(10) as f64 / 10.0;
        ComplexityEstimate {
            overall_score: (0.7 * mean + 0.3 * breadth).clamp(0.0, 1.0),
        }
    }

    /// Sum weights and size the worker pool against the CPU budget.
    ///
    /// `max_concurrency = clamp(floor(cpu_budget / heaviest cpu weight), 1,
    /// concurrency_limit)`, never above the step count. Efficiency is
    /// `n / (waves × max_concurrency)`. An empty list yields zero weights,
    /// `max_concurrency = 1`, and efficiency 1.0.
    pub fn allocate_resources(&self, steps: &[ActionKind]) -> ResourceAllocation {
        if steps.is_empty() {
            return ResourceAllocation {
                total_cpu_weight: 0.0,
                total_memory_weight: 0.0,
                max_concurrency: 1,
                efficiency_score: 1.0,
            };
        }

        let profiles: Vec<ActionProfile> = steps.iter().map(|k| action_profile(*k)).collect();
        let total_cpu_weight = profiles.iter().map(|p| p.cpu_weight).sum();
        let total_memory_weight = profiles.iter().map(|p| p.memory_weight).sum();
        let heaviest = profiles
            .iter()
            .map(|p| p.cpu_weight)
            .fold(0.0_f64, f64::max);

        let by_budget = if heaviest > 0.0 {
            (self.budget.cpu / heaviest).floor() as usize
        } else {
            self.concurrency_limit
        };
        let max_concurrency = by_budget
            .clamp(1, self.concurrency_limit)
            .min(steps.len());

        let n = steps.len();
        let waves = n.div_ceil(max_concurrency);
        let efficiency_score = (n as f64 / (waves * max_concurrency) as f64).clamp(0.0, 1.0);

        ResourceAllocation {
            total_cpu_weight,
            total_memory_weight,
            max_concurrency,
            efficiency_score,
        }
    }
}
