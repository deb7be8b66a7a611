//! Control-flow adapters: `start`, `condition`, `switch`, `map`, `filter`,
//! `split`, `aggregate`, `join`, `wait`, `loop`, `function`, `router`,
//! `human_in_loop`, `log`.
//!
//! Branching blocks (`condition`, `switch`, `router`) return a single chosen
//! port; `split` returns several at once (multi-output branching, spec §1
//! purpose (a)). Everything else emits only the block's default port.
//! Modeled after the `StepType` match-arm style in
//! `other_examples/..._LLM-Dev-Ops-orchestrator__..._executor.rs` and the
//! condition-skip test in the same file.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::error::{CoreError, CoreResult};

use super::{AdapterContext, AdapterOutcome, BlockAdapter};

pub fn builtins() -> Vec<Arc<dyn BlockAdapter>> {
    vec![
        Arc::new(Start),
        Arc::new(Condition),
        Arc::new(Switch),
        Arc::new(Map),
        Arc::new(Filter),
        Arc::new(Split),
        Arc::new(Aggregate),
        Arc::new(Join),
        Arc::new(Wait),
        Arc::new(Loop),
        Arc::new(Function),
        Arc::new(Router),
        Arc::new(HumanInLoop),
        Arc::new(Log),
    ]
}

/// Entry marker: passes its input through unchanged.
pub struct Start;

#[async_trait]
impl BlockAdapter for Start {
    fn kind(&self) -> &'static str {
        "start"
    }

    async fn execute(&self, _ctx: &AdapterContext, _config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        Ok(AdapterOutcome::simple(input.clone()))
    }
}

/// `condition` — evaluates `config.expr` against `$` (the resolved input)
/// and chooses the `true_port`/`false_port` (default `"true"`/`"false"`).
pub struct Condition;

#[async_trait]
impl BlockAdapter for Condition {
    fn kind(&self) -> &'static str {
        "condition"
    }

    fn validate(&self, config: &Value) -> CoreResult<()> {
        if config.get("expr").and_then(Value::as_str).is_none() {
            return Err(CoreError::Validation("condition block requires an expr".into()));
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        self.validate(config)?;
        let expr = config.get("expr").and_then(Value::as_str).unwrap();
        let result = eval_bool_expr(expr, input)?;
        let port = if result {
            config.get("true_port").and_then(Value::as_str).unwrap_or("true")
        } else {
            config.get("false_port").and_then(Value::as_str).unwrap_or("false")
        };
        Ok(AdapterOutcome::branching(json!({ "result": result }), port))
    }
}

/// `switch` — evaluates `config.cases` (an array of `{when, port}`) in
/// order against `$`, picking the first match; falls back to `config.default`
/// or `"default"`.
pub struct Switch;

#[async_trait]
impl BlockAdapter for Switch {
    fn kind(&self) -> &'static str {
        "switch"
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let cases = config.get("cases").and_then(Value::as_array).cloned().unwrap_or_default();
        for case in &cases {
            let when = case.get("when").and_then(Value::as_str).unwrap_or("false");
            if eval_bool_expr(when, input)? {
                let port = case.get("port").and_then(Value::as_str).unwrap_or("default");
                return Ok(AdapterOutcome::branching(input.clone(), port));
            }
        }
        let default_port = config.get("default").and_then(Value::as_str).unwrap_or("default");
        Ok(AdapterOutcome::branching(input.clone(), default_port))
    }
}

/// `map` — applies an identity/pass-through transform over each element of
/// an input array, yielding `{"items": [...]}`. Per-item sub-execution
/// (spawning child step-runs) is left to richer adapter implementations;
/// this block provides the shape-preserving default.
pub struct Map;

#[async_trait]
impl BlockAdapter for Map {
    fn kind(&self) -> &'static str {
        "map"
    }

    async fn execute(&self, _ctx: &AdapterContext, _config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let items = input.get("items").and_then(Value::as_array).cloned().unwrap_or_else(|| match input {
            Value::Array(a) => a.clone(),
            other => vec![other.clone()],
        });
        Ok(AdapterOutcome::simple(json!({ "items": items })))
    }
}

/// `filter` — keeps array elements where `config.predicate` evaluates true
/// with `item` bound to the element (via `$`).
pub struct Filter;

#[async_trait]
impl BlockAdapter for Filter {
    fn kind(&self) -> &'static str {
        "filter"
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let predicate = config.get("predicate").and_then(Value::as_str).unwrap_or("true");
        let items = input.get("items").and_then(Value::as_array).cloned().unwrap_or_else(|| match input {
            Value::Array(a) => a.clone(),
            other => vec![other.clone()],
        });
        let mut kept = Vec::new();
        for item in items {
            if eval_bool_expr(predicate, &item)? {
                kept.push(item);
            }
        }
        Ok(AdapterOutcome::simple(json!({ "items": kept })))
    }
}

/// `split` — fans out to every port named in `config.ports`, all live at
/// once (not exclusive branching like `condition`/`switch`).
pub struct Split;

#[async_trait]
impl BlockAdapter for Split {
    fn kind(&self) -> &'static str {
        "split"
    }

    fn validate(&self, config: &Value) -> CoreResult<()> {
        if config.get("ports").and_then(Value::as_array).map(|a| !a.is_empty()).unwrap_or(false) {
            Ok(())
        } else {
            Err(CoreError::Validation("split block requires a non-empty ports array".into()))
        }
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        self.validate(config)?;
        let ports: Vec<String> = config
            .get("ports")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        Ok(AdapterOutcome::fan_out(input.clone(), ports))
    }
}

/// `aggregate` — collapses an array input into a single summary object
/// (count plus the raw items), used downstream of a `split`/`map` fan-out.
pub struct Aggregate;

#[async_trait]
impl BlockAdapter for Aggregate {
    fn kind(&self) -> &'static str {
        "aggregate"
    }

    async fn execute(&self, _ctx: &AdapterContext, _config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let items = input.get("items").and_then(Value::as_array).cloned().unwrap_or_else(|| match input {
            Value::Array(a) => a.clone(),
            other => vec![other.clone()],
        });
        Ok(AdapterOutcome::simple(json!({ "count": items.len(), "items": items })))
    }
}

/// `join` — fan-in merge. The executor passes the aggregated
/// `{source_step_name: output}` map as `input`; `config.mode` selects
/// `"merge"` (shallow-merge all source objects, default) or `"array"`
/// (collect values into an array).
pub struct Join;

#[async_trait]
impl BlockAdapter for Join {
    fn kind(&self) -> &'static str {
        "join"
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let mode = config.get("mode").and_then(Value::as_str).unwrap_or("merge");
        match mode {
            "array" => {
                let values: Vec<Value> = input.as_object().map(|m| m.values().cloned().collect()).unwrap_or_default();
                Ok(AdapterOutcome::simple(json!(values)))
            }
            _ => {
                let mut merged = serde_json::Map::new();
                if let Some(map) = input.as_object() {
                    for value in map.values() {
                        if let Some(inner) = value.as_object() {
                            for (k, v) in inner {
                                merged.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
                Ok(AdapterOutcome::simple(Value::Object(merged)))
            }
        }
    }
}

/// `wait` — sleeps for `config.duration_ms` (default 0) before passing its
/// input through. Long waits are expected to be bounded by the executor's
/// per-step timeout (spec §5).
pub struct Wait;

#[async_trait]
impl BlockAdapter for Wait {
    fn kind(&self) -> &'static str {
        "wait"
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let ms = config.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
        sleep(Duration::from_millis(ms)).await;
        Ok(AdapterOutcome::simple(input.clone()))
    }
}

/// `loop` — bounded repetition of a pass-through transform, up to
/// `config.max_iterations` (default 1). Child-iteration step-runs, like
/// `map`, are left to a richer adapter; this block records the iteration
/// count it would have run.
pub struct Loop;

#[async_trait]
impl BlockAdapter for Loop {
    fn kind(&self) -> &'static str {
        "loop"
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let max_iterations = config.get("max_iterations").and_then(Value::as_u64).unwrap_or(1);
        Ok(AdapterOutcome::simple(json!({ "iterations": max_iterations, "last_input": input })))
    }
}

/// `function` — evaluates a tiny named built-in transform (`identity`,
/// `uppercase`, `length`) against the input, selected by `config.name`.
/// Stands in for user-authored scripting, which is out of scope for this
/// core (the spec treats block-internal logic as opaque to the executor).
pub struct Function;

#[async_trait]
impl BlockAdapter for Function {
    fn kind(&self) -> &'static str {
        "function"
    }

    async fn execute(&self, ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let name = config.get("name").and_then(Value::as_str).unwrap_or("identity");
        let output = match name {
            "uppercase" => json!(input.as_str().unwrap_or_default().to_uppercase()),
            "length" => json!(match input {
                Value::String(s) => s.len(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => 0,
            }),
            "identity" => input.clone(),
            other => {
                return Err(CoreError::Adapter {
                    step_id: ctx.step_id,
                    step_name: ctx.step_name.clone(),
                    attempt: ctx.attempt,
                    source: anyhow::anyhow!("unknown function '{other}'"),
                })
            }
        };
        Ok(AdapterOutcome::simple(output))
    }
}

/// `router` — like `switch`, but keyed by a single `config.route_key` field
/// read off the input rather than boolean predicates.
pub struct Router;

#[async_trait]
impl BlockAdapter for Router {
    fn kind(&self) -> &'static str {
        "router"
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let route_key = config.get("route_key").and_then(Value::as_str).unwrap_or("route");
        let route = input.get(route_key).and_then(Value::as_str).unwrap_or("default").to_string();
        Ok(AdapterOutcome::branching(input.clone(), route))
    }
}

/// `human_in_loop` — records that a human decision is required and passes
/// `config.default_response` through as output (the actual pause/resume
/// interaction is an external-collaborator concern, out of scope per spec
/// §1 — only the block's contract lives here).
pub struct HumanInLoop;

#[async_trait]
impl BlockAdapter for HumanInLoop {
    fn kind(&self) -> &'static str {
        "human_in_loop"
    }

    async fn execute(&self, _ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let response = config.get("default_response").cloned().unwrap_or_else(|| input.clone());
        Ok(AdapterOutcome::simple(response))
    }
}

/// `log` — writes `config.message` (template-resolved upstream) to the
/// tracing subscriber and passes its input through unchanged.
pub struct Log;

#[async_trait]
impl BlockAdapter for Log {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn execute(&self, ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let message = config.get("message").and_then(Value::as_str).unwrap_or("");
        tracing::info!(step_id = %ctx.step_id, step_name = %ctx.step_name, "{message}");
        Ok(AdapterOutcome::simple(input.clone()))
    }
}

/// Minimal boolean-expression evaluator for `condition`/`switch`/`filter`
/// blocks: `$ <op> literal` where `<op>` is one of `==`, `!=`, `>`, `<`,
/// `>=`, `<=`, and `$` resolves to the (already template-resolved, so
/// typically scalar) input value. A bare `$`/`true`/`false` is also
/// accepted as the whole expression.
fn eval_bool_expr(expr: &str, input: &Value) -> CoreResult<bool> {
    let expr = expr.trim();
    if expr == "true" {
        return Ok(true);
    }
    if expr == "false" {
        return Ok(false);
    }
    if expr == "$" {
        return Ok(truthy(input));
    }

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(pos) = expr.find(op) {
            let lhs = expr[..pos].trim();
            let rhs = expr[pos + op.len()..].trim();
            if lhs != "$" {
                continue;
            }
            let rhs_value = parse_literal(rhs);
            return Ok(compare(input, op, &rhs_value));
        }
    }

    Err(CoreError::Validation(format!("unsupported expression: {expr}")))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn parse_literal(s: &str) -> Value {
    let s = s.trim().trim_matches('"').trim_matches('\'');
    if let Ok(n) = s.parse::<f64>() {
        return json!(n);
    }
    match s {
        "true" => json!(true),
        "false" => json!(false),
        "null" => Value::Null,
        other => json!(other),
    }
}

fn compare(lhs: &Value, op: &str, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(l), Some(r)) => match op {
            "==" => l == r,
            "!=" => l != r,
            ">" => l > r,
            "<" => l < r,
            ">=" => l >= r,
            "<=" => l <= r,
            _ => false,
        },
        _ => match op {
            "==" => lhs == rhs,
            "!=" => lhs != rhs,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_condition_evaluates() {
        assert!(eval_bool_expr("$ > 3", &json!(5)).unwrap());
        assert!(!eval_bool_expr("$ > 3", &json!(2)).unwrap());
    }

    #[test]
    fn equality_on_strings_evaluates() {
        assert!(eval_bool_expr("$ == \"yes\"", &json!("yes")).unwrap());
        assert!(!eval_bool_expr("$ == \"yes\"", &json!("no")).unwrap());
    }

    #[tokio::test]
    async fn split_emits_all_configured_ports() {
        let split = Split;
        let ctx = AdapterContext {
            run_id: uuid::Uuid::nil(),
            step_id: uuid::Uuid::nil(),
            step_name: "s".into(),
            attempt: 1,
            cancellation: tokio_util::sync::CancellationToken::new(),
        };
        let config = json!({ "ports": ["a", "b"] });
        let outcome = split.execute(&ctx, &config, &json!({})).await.unwrap();
        assert_eq!(outcome.chosen_ports, Some(vec!["a".to_string(), "b".to_string()]));
    }
}
