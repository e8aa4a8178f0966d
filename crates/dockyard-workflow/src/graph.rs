//! Step dependency graph: an arena of steps addressed by integer index
//! (spec §9 Design Note: "adjacency lists with integer indices into a step
//! array", not per-step pointers), with cycle detection and deterministic
//! ready-set computation (topological order, tie-break by step id).

use std::collections::{HashMap, HashSet};

use dockyard_persistence::model::{WorkflowRunStepStatus, WorkflowStep};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("workflow definition has a cycle touching step {0}")]
    Cycle(String),
    #[error("step {0} depends on unknown step {1}")]
    UnknownDependency(String, String),
}

/// The step DAG for one workflow definition, indexed by position in
/// `steps` and keyed by step id for lookup.
#[derive(Debug)]
pub struct StepGraph<'a> {
    steps: &'a [WorkflowStep],
    index_of: HashMap<&'a str, usize>,
}

impl<'a> StepGraph<'a> {
    /// Build the graph, validating that every `dependsOn` reference exists
    /// and that the dependency relation is acyclic.
    pub fn build(steps: &'a [WorkflowStep]) -> Result<Self, GraphError> {
        let index_of: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id(), i))
            .collect();

        for step in steps {
            for dep in step.depends_on() {
                if !index_of.contains_key(dep.as_str()) {
                    return Err(GraphError::UnknownDependency(
                        step.id().to_string(),
                        dep.clone(),
                    ));
                }
            }
        }

        let graph = Self { steps, index_of };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.steps.len()];

        fn visit(
            graph: &StepGraph,
            idx: usize,
            marks: &mut Vec<Mark>,
        ) -> Result<(), GraphError> {
            match marks[idx] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    return Err(GraphError::Cycle(graph.steps[idx].id().to_string()))
                }
                Mark::Unvisited => {}
            }
            marks[idx] = Mark::InProgress;
            for dep in graph.steps[idx].depends_on() {
                let dep_idx = graph.index_of[dep.as_str()];
                visit(graph, dep_idx, marks)?;
            }
            marks[idx] = Mark::Done;
            Ok(())
        }

        for idx in 0..self.steps.len() {
            visit(self, idx, &mut marks)?;
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&'a WorkflowStep> {
        self.index_of.get(id).map(|&i| &self.steps[i])
    }

    pub fn steps(&self) -> &'a [WorkflowStep] {
        self.steps
    }

    /// Steps whose `dependsOn` are all `succeeded`, excluding steps already
    /// present (in any status) in `done_or_active`. Returned in a
    /// deterministic order: ascending by step id.
    pub fn ready_steps(
        &self,
        step_status: &HashMap<String, WorkflowRunStepStatus>,
    ) -> Vec<&'a WorkflowStep> {
        let mut ready: Vec<&WorkflowStep> = self
            .steps
            .iter()
            .filter(|step| !step_status.contains_key(step.id()))
            .filter(|step| {
                step.depends_on().iter().all(|dep| {
                    step_status
                        .get(dep)
                        .is_some_and(|s| *s == WorkflowRunStepStatus::Succeeded)
                })
            })
            .collect();
        ready.sort_by(|a, b| a.id().cmp(b.id()));
        ready
    }

    /// Ids of every step that (transitively) depends on `step_id`, used to
    /// cascade `skipped` when a step fails permanently.
    pub fn descendants_of(&self, step_id: &str) -> HashSet<&'a str> {
        let mut descendants = HashSet::new();
        let mut frontier = vec![step_id];
        while let Some(current) = frontier.pop() {
            for step in self.steps {
                if step.depends_on().iter().any(|d| d == current) && descendants.insert(step.id())
                {
                    frontier.push(step.id());
                }
            }
        }
        descendants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str, depends_on: &[&str]) -> WorkflowStep {
        WorkflowStep::Job {
            id: id.to_string(),
            job_slug: "noop".to_string(),
            parameter_template: json!({}),
            retry_override: None,
            timeout_override: None,
            store_result_as: None,
            produces: vec![],
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn linear_chain_ready_sets() {
        let steps = vec![job("a", &[]), job("b", &["a"]), job("c", &["b"])];
        let graph = StepGraph::build(&steps).unwrap();

        let status = HashMap::new();
        let ready = graph.ready_steps(&status);
        assert_eq!(ready.iter().map(|s| s.id()).collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn detects_cycle() {
        let steps = vec![job("a", &["b"]), job("b", &["a"])];
        let err = StepGraph::build(&steps).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let steps = vec![job("a", &["missing"])];
        let err = StepGraph::build(&steps).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency(_, _)));
    }

    #[test]
    fn descendants_includes_transitive_dependents() {
        let steps = vec![job("a", &[]), job("b", &["a"]), job("c", &["b"])];
        let graph = StepGraph::build(&steps).unwrap();
        let descendants = graph.descendants_of("a");
        assert!(descendants.contains("b"));
        assert!(descendants.contains("c"));
    }

    #[test]
    fn ready_set_tie_breaks_by_step_id() {
        let steps = vec![job("z", &[]), job("a", &[])];
        let graph = StepGraph::build(&steps).unwrap();
        let ready = graph.ready_steps(&HashMap::new());
        assert_eq!(ready.iter().map(|s| s.id()).collect::<Vec<_>>(), vec!["a", "z"]);
    }
}
