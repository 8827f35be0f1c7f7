//! Compiled workflow dependency graph.
//!
//! `WorkflowGraph::compile` is a pure function from a `WorkflowDefinition` to
//! an immutable graph: stage specs in definition order plus index-based
//! adjacency in both directions. Acyclicity is checked with
//! `petgraph::algo::toposort`; the orderings the scheduler relies on are
//! computed with definition-order tie-breaks so that compiling the same
//! definition twice yields identical graphs and identical ready orders.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use switchyard_types::error::WorkflowError;
use switchyard_types::workflow::{StageSpec, WorkflowDefinition};

use super::definition::validate_definition;

/// An immutable, validated stage DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph {
    name: String,
    max_parallelism: Option<usize>,
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
    /// Direct dependencies per stage, deduplicated, in declared order.
    dependencies: Vec<Vec<usize>>,
    /// Direct dependents per stage, ascending by definition index.
    dependents: Vec<Vec<usize>>,
}

impl WorkflowGraph {
    /// Validate and compile a definition.
    ///
    /// Fails with `DuplicateStageId`, `DanglingDependency`, `CyclicGraph`
    /// (including self-dependencies), or `Validation` for structural
    /// problems. Duplicate entries within one `depends_on` list collapse.
    pub fn compile(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        validate_definition(def)?;

        let mut index = HashMap::with_capacity(def.stages.len());
        for (i, stage) in def.stages.iter().enumerate() {
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateStageId(stage.id.clone()));
            }
        }

        let mut stages = def.stages.clone();
        let mut dependencies = vec![Vec::new(); stages.len()];
        let mut dependents = vec![Vec::new(); stages.len()];

        for (i, stage) in stages.iter_mut().enumerate() {
            let mut seen = BTreeSet::new();
            let mut deduped = Vec::with_capacity(stage.depends_on.len());
            for dep in &stage.depends_on {
                let Some(&from) = index.get(dep.as_str()) else {
                    return Err(WorkflowError::DanglingDependency {
                        stage_id: stage.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if from == i {
                    return Err(WorkflowError::CyclicGraph {
                        stage_id: stage.id.clone(),
                    });
                }
                if seen.insert(from) {
                    dependencies[i].push(from);
                    dependents[from].push(i);
                    deduped.push(dep.clone());
                }
            }
            stage.depends_on = deduped;
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        // Edge from dependency -> dependent
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..stages.len()).map(|i| graph.add_node(i)).collect();
        for (to, deps) in dependencies.iter().enumerate() {
            for &from in deps {
                graph.add_edge(nodes[from], nodes[to], ());
            }
        }
        toposort(&graph, None).map_err(|cycle| WorkflowError::CyclicGraph {
            stage_id: stages[graph[cycle.node_id()]].id.clone(),
        })?;

        tracing::debug!(workflow = %def.name, stages = stages.len(), "compiled workflow graph");

        Ok(Self {
            name: def.name.clone(),
            max_parallelism: def.max_parallelism,
            stages,
            index,
            dependencies,
            dependents,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workflow-level parallelism override, if declared.
    pub fn max_parallelism(&self) -> Option<usize> {
        self.max_parallelism
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Stage specs in definition order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&StageSpec> {
        self.index_of(id).map(|i| &self.stages[i])
    }

    /// Definition index of a stage.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct dependency indices of the stage at `index`.
    pub fn dependency_indices(&self, index: usize) -> &[usize] {
        self.dependencies
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct dependent indices of the stage at `index`, ascending.
    pub fn dependent_indices(&self, index: usize) -> &[usize] {
        self.dependents
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| self.ids(self.dependency_indices(i).iter().copied()))
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| self.ids(self.dependent_indices(i).iter().copied()))
            .unwrap_or_default()
    }

    /// Every stage reachable downstream of `id`, in definition order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };
        let mut visited = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for &next in self.dependent_indices(current) {
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        self.ids(visited.into_iter())
    }

    /// All `(dependency, dependent)` edges, sorted.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        let mut edges: Vec<(&str, &str)> = self
            .dependencies
            .iter()
            .enumerate()
            .flat_map(|(to, deps)| {
                deps.iter()
                    .map(move |&from| (self.stages[from].id.as_str(), self.stages[to].id.as_str()))
            })
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Stages with no dependencies, in definition order.
    pub fn roots(&self) -> Vec<&str> {
        self.ids((0..self.stages.len()).filter(|&i| self.dependencies[i].is_empty()))
    }

    /// Kahn's algorithm, always taking the lowest definition index among the
    /// currently ready stages.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.stages.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in self.dependent_indices(next) {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        self.ids(order.into_iter())
    }

    /// Stages grouped by depth (longest dependency path from a root).
    /// Every stage in a wave depends only on stages in earlier waves.
    pub fn execution_waves(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.stages.len()];
        for id in self.topological_order() {
            let Some(i) = self.index_of(id) else { continue };
            depth[i] = self
                .dependency_indices(i)
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
        let Some(&max_depth) = depth.iter().max() else {
            return Vec::new();
        };
        let mut waves = vec![Vec::new(); max_depth + 1];
        for (i, stage) in self.stages.iter().enumerate() {
            waves[depth[i]].push(stage.id.as_str());
        }
        waves
    }

    fn ids(&self, indices: impl Iterator<Item = usize>) -> Vec<&str> {
        indices.map(|i| self.stages[i].id.as_str()).collect()
    }
}
