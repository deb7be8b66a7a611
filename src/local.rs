//! Offline/local flow runner.
//!
//! Loads a project definition from a local YAML/JSON file and executes it
//! through the same [`Graph`]/[`Executor`]/[`Registry`] the worker uses,
//! against an in-memory block catalog with no queue or database involved —
//! useful for trying out a project definition before it's persisted. A
//! generalization of the teacher's original `run-flow` subcommand (which
//! loaded a flat YAML flow) to the richer project/step/edge shape.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog;
use crate::context::ExecutionContext;
use crate::error::CoreError;
use crate::executor::{self, Executor};
use crate::graph::Graph;
use crate::model::{Edge, ProjectDefinition, Run, Step, StepRun, DEFAULT_PORT};

/// On-disk project shape: steps and edges reference each other by name
/// rather than id, so a project can be hand-written without juggling UUIDs.
#[derive(Debug, Deserialize)]
pub struct LocalProjectFile {
    #[serde(default = "default_project_name")]
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub steps: Vec<LocalStep>,
    #[serde(default)]
    pub edges: Vec<LocalEdge>,
}

fn default_project_name() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LocalStep {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Deserialize)]
pub struct LocalEdge {
    pub source: String,
    #[serde(default = "default_port_owned")]
    pub source_port: String,
    pub target: String,
    #[serde(default = "default_port_owned")]
    pub target_port: String,
}

fn default_port_owned() -> String {
    DEFAULT_PORT.to_string()
}

pub struct LocalRunResult {
    pub output: Value,
    pub step_runs: Vec<StepRun>,
}

/// Parses a local project file (YAML, or JSON — a YAML-syntax subset) into
/// a `ProjectDefinition` with freshly generated step ids.
pub fn load_project_file(path: &Path) -> crate::error::CoreResult<ProjectDefinition> {
    let contents = std::fs::read_to_string(path).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
    let file: LocalProjectFile = serde_yaml::from_str(&contents).map_err(|e| CoreError::Validation(format!("invalid project file: {e}")))?;
    project_from_file(file)
}

fn project_from_file(file: LocalProjectFile) -> crate::error::CoreResult<ProjectDefinition> {
    let project_id = Uuid::nil();
    let mut ids_by_name: HashMap<String, Uuid> = HashMap::new();
    let mut steps = Vec::with_capacity(file.steps.len());

    for local_step in &file.steps {
        if ids_by_name.contains_key(&local_step.name) {
            return Err(CoreError::Validation(format!("duplicate step name '{}'", local_step.name)));
        }
        let id = Uuid::new_v4();
        ids_by_name.insert(local_step.name.clone(), id);
        steps.push(Step {
            id,
            project_id,
            name: local_step.name.clone(),
            kind: local_step.kind.clone(),
            config: local_step.config.clone(),
            block_group_id: None,
            group_role: None,
            idempotency_key: None,
            position: (0.0, 0.0),
        });
    }

    let mut edges = Vec::with_capacity(file.edges.len());
    for local_edge in &file.edges {
        let source_step_id = *ids_by_name
            .get(&local_edge.source)
            .ok_or_else(|| CoreError::Validation(format!("edge references unknown step '{}'", local_edge.source)))?;
        let target_step_id = *ids_by_name
            .get(&local_edge.target)
            .ok_or_else(|| CoreError::Validation(format!("edge references unknown step '{}'", local_edge.target)))?;
        edges.push(Edge {
            source_step_id,
            source_port: local_edge.source_port.clone(),
            target_step_id,
            target_port: local_edge.target_port.clone(),
        });
    }

    Ok(ProjectDefinition {
        project_id,
        tenant_id: crate::model::SYSTEM_TENANT_ID,
        version: 1,
        name: file.name,
        variables: file.variables,
        steps,
        edges,
    })
}

/// Runs a locally loaded project definition to completion with the given
/// input document, returning the terminal output plus every step-run
/// recorded along the way.
pub async fn run_local(definition: ProjectDefinition, input: Option<Value>, executor: &Executor) -> crate::error::CoreResult<LocalRunResult> {
    let blocks = catalog::builtin_blocks();
    let graph = Graph::build(&definition, &blocks)?;

    let mut run = Run::new(definition.tenant_id, definition.project_id, definition.version, 1);
    run.input = input;

    let mut ctx = ExecutionContext::new(run, definition, 1, 0);
    let cancellation = CancellationToken::new();
    executor.execute(&mut ctx, &graph, cancellation).await?;

    let output = executor::terminal_output(&ctx, &graph);
    Ok(LocalRunResult {
        output,
        step_runs: ctx.step_runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_project_file() {
        let yaml = r#"
name: demo
steps:
  - name: start
    type: mock
  - name: finish
    type: mock
edges:
  - source: start
    target: finish
"#;
        let file: LocalProjectFile = serde_yaml::from_str(yaml).unwrap();
        let def = project_from_file(file).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.edges.len(), 1);
        assert_eq!(def.edges[0].source_port, DEFAULT_PORT);
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let yaml = r#"
name: demo
steps:
  - name: start
    type: mock
  - name: start
    type: mock
"#;
        let file: LocalProjectFile = serde_yaml::from_str(yaml).unwrap();
        assert!(project_from_file(file).is_err());
    }

    #[test]
    fn edge_to_unknown_step_is_rejected() {
        let yaml = r#"
name: demo
steps:
  - name: start
    type: mock
edges:
  - source: start
    target: missing
"#;
        let file: LocalProjectFile = serde_yaml::from_str(yaml).unwrap();
        assert!(project_from_file(file).is_err());
    }
}
