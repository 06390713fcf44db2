//! Step graph construction, cycle detection, and wave computation.
//!
//! Uses `petgraph` to model prerequisite edges between stages. Topological
//! sort detects cycles at plan-acceptance time, and depth-based grouping
//! produces the waves the scheduler runs after the primary action.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use remedy_types::plan::{RemediationPlan, SecondaryAction, PRIMARY_STAGE_ID};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("stage '{stage}' depends on unknown stage '{prerequisite}'")]
    UnknownPrerequisite { stage: String, prerequisite: String },

    #[error("cycle detected involving stage '{0}'")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// Plan-level validation
// ---------------------------------------------------------------------------

/// Validate that the plan's stages form a DAG over their prerequisites.
///
/// Nodes are the primary stage plus every secondary; edges run from
/// prerequisite to dependent.
pub fn validate_step_graph(plan: &RemediationPlan) -> Result<(), DagError> {
    let mut ids: Vec<String> = vec![PRIMARY_STAGE_ID.to_string()];
    ids.extend(plan.secondary_actions.iter().map(|s| s.stage_id()));

    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = ids
        .iter()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();

    for step in &plan.secondary_actions {
        let stage = step.stage_id();
        let to = nodes[stage.as_str()];
        for prereq in &step.prerequisites {
            let from = nodes.get(prereq.as_str()).ok_or_else(|| DagError::UnknownPrerequisite {
                stage: stage.clone(),
                prerequisite: prereq.clone(),
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| DagError::CycleDetected(graph[cycle.node_id()].to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Wave computation
// ---------------------------------------------------------------------------

/// Group `steps` into waves that can run concurrently.
///
/// Prerequisites naming stages outside `steps` are treated as already
/// resolved (the primary and parallel stages are terminal by the time these
/// waves run). Each wave is ordered by `execution_order`.
pub fn build_waves<'a>(
    steps: &[&'a SecondaryAction],
) -> Result<Vec<Vec<&'a SecondaryAction>>, DagError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<String> = steps.iter().map(|s| s.stage_id()).collect();
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
    let index: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    for (i, step) in steps.iter().enumerate() {
        for prereq in &step.prerequisites {
            if let Some(&from) = index.get(prereq.as_str()) {
                graph.add_edge(nodes[from], nodes[i], ());
            }
        }
    }

    let sorted = toposort(&graph, None)
        .map_err(|cycle| DagError::CycleDetected(ids[graph[cycle.node_id()]].clone()))?;

    // Depth: longest chain of in-set prerequisites.
    let mut depths = vec![0usize; steps.len()];
    for node in sorted {
        let i = graph[node];
        depths[i] = steps[i]
            .prerequisites
            .iter()
            .filter_map(|p| index.get(p.as_str()))
            .map(|&dep| depths[dep] + 1)
            .max()
            .unwrap_or(0);
    }

    let max_depth = depths.iter().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&'a SecondaryAction>> = vec![vec![]; max_depth + 1];
    for (i, step) in steps.iter().enumerate() {
        waves[depths[i]].push(*step);
    }
    for wave in &mut waves {
        wave.sort_by_key(|s| s.execution_order);
    }
    Ok(waves)
}
