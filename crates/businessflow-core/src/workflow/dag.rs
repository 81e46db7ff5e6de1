//! DAG builder, cycle detection, and dependency queries.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort detects cycles at publish time; depth-based grouping produces the
//! waves shown to operators, and the transitive closure tells the validator
//! which step outputs a mapping may legally reference.

use std::collections::{HashMap, HashSet};

use businessflow_types::workflow::StepDefinition;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::DefinitionError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build a `DiGraph` with an edge from each dependency to its dependent.
fn build_graph(
    steps: &[StepDefinition],
) -> Result<(DiGraph<&str, ()>, Vec<NodeIndex>), DefinitionError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                DefinitionError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    Ok((graph, node_indices))
}

// ---------------------------------------------------------------------------
// Validation and ordering
// ---------------------------------------------------------------------------

/// Validate that steps form a DAG (no cycles, all references exist).
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), DefinitionError> {
    topological_order(steps).map(|_| ())
}

/// Step IDs in a topological order (dependencies before dependents).
pub fn topological_order(steps: &[StepDefinition]) -> Result<Vec<&str>, DefinitionError> {
    let (graph, _) = build_graph(steps)?;
    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        DefinitionError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
    })?;
    Ok(sorted.into_iter().map(|idx| graph[idx]).collect())
}

/// Group steps into waves: every step in a wave depends only on earlier waves.
///
/// Index 0 holds the root steps. Steps keep their definition order inside a wave.
pub fn build_execution_plan<'a>(
    steps: &'a [StepDefinition],
) -> Result<Vec<Vec<&'a StepDefinition>>, DefinitionError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let id_to_step: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    // Root nodes have depth 0
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for step_id in topological_order(steps)? {
        let step = id_to_step[step_id];
        let depth = step
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step_id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDefinition>> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[step.id.as_str()]].push(step);
    }

    Ok(waves)
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all upstream steps of `step_id`.
///
/// If `step_id` is not found, returns an empty set.
pub fn upstream_steps<'a>(step_id: &str, steps: &'a [StepDefinition]) -> HashSet<&'a str> {
    let step_map: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited = HashSet::new();
    let mut stack = vec![step_id];

    while let Some(current) = stack.pop() {
        if let Some(step) = step_map.get(current) {
            for dep in &step.depends_on {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    visited
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
