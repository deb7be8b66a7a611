//! C1 — immutable in-memory project DAG.
//!
//! Builds `steps_by_id`/`edges_by_source`/`edges_by_target`/`terminal_steps`/
//! `group_of_step` from a loaded `ProjectDefinition`, and validates it per
//! spec §4.1: edge endpoints must reference present steps, edge ports must
//! exist on the target block (or be `"default"`), the graph must be acyclic,
//! and every step's `type` must resolve to an enabled block.
//!
//! Modeled after the teacher's `flow::build_step_graph`: a petgraph `Graph`
//! plus a name/id index, with Kahn-ordering (`petgraph::algo::toposort`) for
//! cycle detection.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{BlockDefinition, Edge, ProjectDefinition, Step};

/// A validated, immutable in-memory DAG for one project definition.
pub struct Graph {
    pub steps_by_id: HashMap<Uuid, Step>,
    pub edges_by_source: HashMap<Uuid, Vec<Edge>>,
    pub edges_by_target: HashMap<Uuid, Vec<Edge>>,
    pub group_of_step: HashMap<Uuid, Uuid>,
    node_index: HashMap<Uuid, NodeIndex>,
    dag: DiGraph<Uuid, ()>,
}

impl Graph {
    /// Builds the graph without validating it — used internally by `build`
    /// and by callers that want to inspect a possibly-invalid definition.
    fn from_definition(def: &ProjectDefinition) -> Self {
        let mut dag = DiGraph::new();
        let mut node_index = HashMap::new();
        let mut steps_by_id = HashMap::new();
        let mut group_of_step = HashMap::new();

        for step in &def.steps {
            let idx = dag.add_node(step.id);
            node_index.insert(step.id, idx);
            steps_by_id.insert(step.id, step.clone());
            if let Some(group) = step.block_group_id {
                group_of_step.insert(step.id, group);
            }
        }

        let mut edges_by_source: HashMap<Uuid, Vec<Edge>> = HashMap::new();
        let mut edges_by_target: HashMap<Uuid, Vec<Edge>> = HashMap::new();

        for edge in &def.edges {
            if let (Some(&src), Some(&tgt)) = (
                node_index.get(&edge.source_step_id),
                node_index.get(&edge.target_step_id),
            ) {
                dag.add_edge(src, tgt, ());
            }
            edges_by_source
                .entry(edge.source_step_id)
                .or_default()
                .push(edge.clone());
            edges_by_target
                .entry(edge.target_step_id)
                .or_default()
                .push(edge.clone());
        }

        Self {
            steps_by_id,
            edges_by_source,
            edges_by_target,
            group_of_step,
            node_index,
            dag,
        }
    }

    /// Builds and validates a DAG from a project definition, using the
    /// block catalog to check port existence and enabled-ness.
    pub fn build(def: &ProjectDefinition, blocks: &HashMap<String, BlockDefinition>) -> CoreResult<Self> {
        let graph = Self::from_definition(def);
        graph.validate(def, blocks)?;
        Ok(graph)
    }

    fn validate(&self, def: &ProjectDefinition, blocks: &HashMap<String, BlockDefinition>) -> CoreResult<()> {
        // (i) every edge endpoint references a present step.
        for edge in &def.edges {
            if !self.steps_by_id.contains_key(&edge.source_step_id) {
                return Err(CoreError::InvalidEdge(edge.source_step_id));
            }
            if !self.steps_by_id.contains_key(&edge.target_step_id) {
                return Err(CoreError::InvalidEdge(edge.target_step_id));
            }
        }

        // (iv) every step's type resolves to an enabled block.
        for step in &def.steps {
            let block = blocks.get(&step.kind).ok_or_else(|| CoreError::UnknownBlock(step.kind.clone()))?;
            if !block.enabled {
                return Err(CoreError::Validation(format!(
                    "step '{}' uses disabled block '{}'",
                    step.name, step.kind
                )));
            }
        }

        // (ii) referenced source/target ports exist on the block definition
        // (or equal "default").
        for edge in &def.edges {
            let source_step = &self.steps_by_id[&edge.source_step_id];
            let target_step = &self.steps_by_id[&edge.target_step_id];
            let source_block = &blocks[&source_step.kind];
            let target_block = &blocks[&target_step.kind];

            if edge.source_port != crate::model::DEFAULT_PORT && !source_block.has_output_port(&edge.source_port) {
                return Err(CoreError::Validation(format!(
                    "step '{}' has no output port '{}'",
                    source_step.name, edge.source_port
                )));
            }
            if !target_block.has_input_port(&edge.target_port) {
                return Err(CoreError::Validation(format!(
                    "step '{}' has no input port '{}'",
                    target_step.name, edge.target_port
                )));
            }
        }

        // (iii) the graph is acyclic, detected via Kahn-ordering.
        if let Err(cycle) = toposort(&self.dag, None) {
            let step_id = self.dag[cycle.node_id()];
            return Err(CoreError::Cycle(step_id));
        }

        Ok(())
    }

    /// Steps with no outgoing edges.
    pub fn terminal_steps(&self) -> Vec<Uuid> {
        self.steps_by_id
            .keys()
            .filter(|id| !self.edges_by_source.contains_key(*id))
            .copied()
            .collect()
    }

    /// Steps with no incoming edges — ready at run start.
    pub fn entry_steps(&self) -> Vec<Uuid> {
        self.steps_by_id
            .keys()
            .filter(|id| !self.edges_by_target.contains_key(*id))
            .copied()
            .collect()
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps_by_id.get(&id)
    }

    pub fn incoming(&self, id: Uuid) -> &[Edge] {
        self.edges_by_target.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing(&self, id: Uuid) -> &[Edge] {
        self.edges_by_source.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OutputPort, ProjectDefinition};
    use std::collections::HashMap as Map;

    fn mock_block(slug: &str) -> BlockDefinition {
        BlockDefinition {
            slug: slug.to_string(),
            tenant_id: None,
            input_ports: vec![],
            output_ports: vec![OutputPort {
                name: "default".into(),
                is_default: true,
                schema: None,
            }],
            config_schema: None,
            category: "test".into(),
            enabled: true,
            version: 1,
        }
    }

    fn step(name: &str, kind: &str) -> Step {
        Step {
            id: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: name.to_string(),
            kind: kind.to_string(),
            config: serde_json::Value::Null,
            block_group_id: None,
            group_role: None,
            idempotency_key: None,
            position: (0.0, 0.0),
        }
    }

    #[test]
    fn linear_chain_has_one_entry_and_one_terminal() {
        let a = step("a", "mock");
        let b = step("b", "mock");
        let edge = Edge {
            source_step_id: a.id,
            source_port: "default".into(),
            target_step_id: b.id,
            target_port: "default".into(),
        };
        let def = ProjectDefinition {
            project_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            version: 1,
            name: "p".into(),
            variables: Map::new(),
            steps: vec![a.clone(), b.clone()],
            edges: vec![edge],
        };
        let mut blocks = Map::new();
        blocks.insert("mock".to_string(), mock_block("mock"));

        let graph = Graph::build(&def, &blocks).unwrap();
        assert_eq!(graph.entry_steps(), vec![a.id]);
        assert_eq!(graph.terminal_steps(), vec![b.id]);
    }

    #[test]
    fn cycle_is_rejected() {
        let a = step("a", "mock");
        let b = step("b", "mock");
        let edges = vec![
            Edge {
                source_step_id: a.id,
                source_port: "default".into(),
                target_step_id: b.id,
                target_port: "default".into(),
            },
            Edge {
                source_step_id: b.id,
                source_port: "default".into(),
                target_step_id: a.id,
                target_port: "default".into(),
            },
        ];
        let def = ProjectDefinition {
            project_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            version: 1,
            name: "p".into(),
            variables: Map::new(),
            steps: vec![a, b],
            edges,
        };
        let mut blocks = Map::new();
        blocks.insert("mock".to_string(), mock_block("mock"));

        let err = Graph::build(&def, &blocks).unwrap_err();
        assert!(matches!(err, CoreError::Cycle(_)));
    }

    #[test]
    fn unknown_block_is_rejected() {
        let a = step("a", "ghost");
        let def = ProjectDefinition {
            project_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            version: 1,
            name: "p".into(),
            variables: Map::new(),
            steps: vec![a],
            edges: vec![],
        };
        let blocks = Map::new();
        let err = Graph::build(&def, &blocks).unwrap_err();
        assert!(matches!(err, CoreError::UnknownBlock(_)));
    }
}
