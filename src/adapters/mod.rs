//! C3 — adapter registry.
//!
//! Each block kind is implemented by a [`BlockAdapter`] exposing `kind`,
//! `validate`, and `execute`. Control-flow adapters additionally return a
//! `chosen_port` indicating which outgoing port(s) stay live — modeled as a
//! sum-type field on [`AdapterOutcome`] rather than a subtype, per the
//! spec's Design Notes (§9).
//!
//! The registry is populated once at worker start-up (`Registry::with_builtins`)
//! and is read-only thereafter; lookups that miss return `ErrUnknownBlock`.

mod control_flow;
mod http;
mod llm;
mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::usage::UsageRecord;

/// Per-step scoped context handed to an adapter's `execute`. Carries
/// identity for logging/error-wrapping and the cancellation token derived
/// from the run's root token (spec §5).
pub struct AdapterContext {
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub attempt: i64,
    pub cancellation: CancellationToken,
}

/// Outcome of a successful adapter dispatch.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub output: Value,
    /// `Some(ports)` for blocks that select their own live outgoing ports —
    /// exclusive branching (condition/switch/router emit one port) or
    /// multi-output fan-out (split emits several at once). `None` for
    /// regular blocks, which always emit just the block's default port.
    pub chosen_ports: Option<Vec<String>>,
    pub usage: Option<UsageRecord>,
}

impl AdapterOutcome {
    pub fn simple(output: Value) -> Self {
        Self {
            output,
            chosen_ports: None,
            usage: None,
        }
    }

    pub fn branching(output: Value, port: impl Into<String>) -> Self {
        Self {
            output,
            chosen_ports: Some(vec![port.into()]),
            usage: None,
        }
    }

    pub fn fan_out(output: Value, ports: Vec<String>) -> Self {
        Self {
            output,
            chosen_ports: Some(ports),
            usage: None,
        }
    }
}

#[async_trait]
pub trait BlockAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Lints the opaque `config` map; called at validation time and before
    /// execution.
    fn validate(&self, config: &Value) -> CoreResult<()> {
        let _ = config;
        Ok(())
    }

    async fn execute(&self, ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome>;
}

/// Read-only, process-wide set of block adapters keyed by slug.
#[derive(Clone)]
pub struct Registry {
    adapters: Arc<HashMap<&'static str, Arc<dyn BlockAdapter>>>,
}

impl Registry {
    pub fn new(adapters: Vec<Arc<dyn BlockAdapter>>) -> Self {
        let map = adapters.into_iter().map(|a| (a.kind(), a)).collect();
        Self {
            adapters: Arc::new(map),
        }
    }

    /// The built-in catalog from spec §4.4: `mock`, `http`, `llm-openai`,
    /// `llm-anthropic`, plus control-flow kinds.
    pub fn with_builtins() -> Self {
        let mut adapters: Vec<Arc<dyn BlockAdapter>> = vec![
            Arc::new(mock::MockAdapter),
            Arc::new(http::HttpAdapter::new()),
            Arc::new(llm::LlmAdapter::openai()),
            Arc::new(llm::LlmAdapter::anthropic()),
        ];
        adapters.extend(control_flow::builtins());
        Self::new(adapters)
    }

    pub fn get(&self, kind: &str) -> CoreResult<Arc<dyn BlockAdapter>> {
        self.adapters
            .get(kind)
            .cloned()
            .ok_or_else(|| CoreError::UnknownBlock(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_the_catalog() {
        let reg = Registry::with_builtins();
        for kind in [
            "mock",
            "http",
            "llm-openai",
            "llm-anthropic",
            "start",
            "condition",
            "switch",
            "map",
            "filter",
            "split",
            "aggregate",
            "join",
            "wait",
            "loop",
            "function",
            "router",
            "human_in_loop",
            "log",
        ] {
            assert!(reg.contains(kind), "missing builtin adapter: {kind}");
        }
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let reg = Registry::with_builtins();
        assert!(matches!(reg.get("nope"), Err(CoreError::UnknownBlock(_))));
    }
}
