//! Built-in block catalog: the `BlockDefinition` rows backing the adapters
//! registered in [`crate::adapters::Registry::with_builtins`]. Used both by
//! [`crate::graph::Graph::build`] (port/enabled validation) and by the
//! seeder (`seed.rs`) as the in-code source of truth it upserts against the
//! stored catalog (spec §4.9/§6).
//!
//! Blocks whose outgoing ports are data-driven (`switch`'s `cases`,
//! `router`'s `route_key`) declare an empty `output_ports` list, which
//! [`crate::model::BlockDefinition::has_output_port`] treats as "any port
//! name is valid" rather than enumerating every possible case up front.

use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;

use crate::model::{BlockDefinition, Edge, OutputPort, Step};

fn port(name: &str, is_default: bool) -> OutputPort {
    OutputPort {
        name: name.to_string(),
        is_default,
        schema: None,
    }
}

fn default_port_only() -> Vec<OutputPort> {
    vec![port("default", true)]
}

/// The full built-in system block catalog, keyed by slug. `version` starts
/// at `1` for every entry; the seeder bumps it when an in-code definition
/// diverges from the stored one.
pub fn builtin_blocks() -> HashMap<String, BlockDefinition> {
    let defs = vec![
        BlockDefinition {
            slug: "mock".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "testing".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "http".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "integration".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "llm-openai".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "ai".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "llm-anthropic".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "ai".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "start".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "condition".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: vec![port("true", false), port("false", false)],
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "switch".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: vec![],
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "map".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "filter".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "split".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: vec![],
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "aggregate".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "join".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "wait".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "loop".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "function".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "router".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: vec![],
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "human_in_loop".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
        BlockDefinition {
            slug: "log".into(),
            tenant_id: Some(crate::model::SYSTEM_TENANT_ID),
            input_ports: vec![],
            output_ports: default_port_only(),
            config_schema: None,
            category: "control_flow".into(),
            enabled: true,
            version: 1,
        },
    ];

    defs.into_iter().map(|d| (d.slug.clone(), d)).collect()
}

/// The system-tenant demo project seeded alongside the block catalog: a
/// two-step linear chain (`start -> log`) useful as a smoke-test project
/// right after a fresh seed.
pub fn system_demo_project_id() -> Uuid {
    Uuid::from_u128(2)
}

pub fn system_demo_start_step_id() -> Uuid {
    Uuid::from_u128(3)
}

pub fn system_demo_log_step_id() -> Uuid {
    Uuid::from_u128(4)
}

/// Builds the `start -> log` step/edge pair the system demo project's
/// description promises, for the seeder to persist alongside the `Project`
/// row itself.
pub fn system_demo_steps_and_edges(project_id: Uuid) -> (Vec<Step>, Vec<Edge>) {
    let start = Step {
        id: system_demo_start_step_id(),
        project_id,
        name: "start".into(),
        kind: "start".into(),
        config: json!({}),
        block_group_id: None,
        group_role: None,
        idempotency_key: None,
        position: (0.0, 0.0),
    };
    let log = Step {
        id: system_demo_log_step_id(),
        project_id,
        name: "log".into(),
        kind: "log".into(),
        config: json!({ "message": "system smoke test reached the log step" }),
        block_group_id: None,
        group_role: None,
        idempotency_key: None,
        position: (200.0, 0.0),
    };
    let edge = Edge {
        source_step_id: start.id,
        source_port: "default".into(),
        target_step_id: log.id,
        target_port: "default".into(),
    };
    (vec![start, log], vec![edge])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_adapter_has_a_catalog_entry() {
        let blocks = builtin_blocks();
        let registry = crate::adapters::Registry::with_builtins();
        for slug in blocks.keys() {
            assert!(registry.contains(slug), "catalog entry '{slug}' has no adapter");
        }
    }

    #[test]
    fn dynamic_blocks_accept_any_output_port() {
        let blocks = builtin_blocks();
        let switch = &blocks["switch"];
        assert!(switch.has_output_port("anything"));
    }
}
