//! C5 — the DAG scheduler.
//!
//! `execute` runs the full DAG; `execute_single_step` runs exactly one step
//! reusing injected outputs for template resolution; `execute_from_step`
//! seeds the ready set with one step and lets normal DAG progression carry
//! downstream. Ties among simultaneously-ready steps break by step name
//! (spec §4.2). Bounded-parallel dispatch and cancellation follow
//! `other_examples/..._vanyastaff-nebula__crates-engine-src-engine.rs`
//! (`Semaphore` + `JoinSet` + `CancellationToken`); the scheduling loop
//! itself generalizes the teacher's `engine::run_flow` topological walk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterContext, AdapterOutcome, Registry};
use crate::context::ExecutionContext;
use crate::error::{CoreError, CoreResult};
use crate::graph::Graph;
use crate::model::{Edge, RetryPolicy, StepRun, DEFAULT_PORT, IDEMPOTENCY_KEY_FIELD};
use crate::template::{self, ResolveContext};
use crate::usage::UsageRecorder;

/// Default cap on simultaneously-dispatched steps (spec §5).
pub const DEFAULT_PARALLELISM: usize = 8;

pub struct Executor {
    registry: Registry,
    usage_recorder: Option<UsageRecorder>,
    max_parallelism: usize,
}

/// Per-step book-keeping the scheduler needs beyond what's in
/// `ExecutionContext` — which outgoing ports stayed live, and whether the
/// step completed, failed, or was skipped.
#[derive(Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Completed,
    Failed,
    Skipped,
}

impl Executor {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            usage_recorder: None,
            max_parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_usage_recorder(mut self, recorder: UsageRecorder) -> Self {
        self.usage_recorder = Some(recorder);
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max.max(1);
        self
    }

    /// Runs the full DAG to completion (or to the point of failure/cancel).
    /// Returns `Ok(())` if every reachable step reached `completed` or
    /// `skipped`; an `Err` means a step failed or the run was cancelled —
    /// the caller (worker) decides what that means for `Run` status.
    pub async fn execute(&self, ctx: &mut ExecutionContext, graph: &Graph, cancellation: CancellationToken) -> CoreResult<()> {
        let mut outcomes: HashMap<Uuid, StepOutcome> = HashMap::new();
        let mut live_ports: HashMap<Uuid, HashSet<String>> = HashMap::new();
        let mut pruned_edges: HashSet<(Uuid, String, Uuid, String)> = HashSet::new();

        let injected_ids: Vec<Uuid> = ctx.injected_outputs.keys().copied().collect();
        for id in injected_ids {
            outcomes.insert(id, StepOutcome::Completed);
            live_ports.insert(id, [DEFAULT_PORT.to_string()].into_iter().collect());
        }

        let mut pending: HashSet<Uuid> = graph
            .steps_by_id
            .keys()
            .copied()
            .filter(|id| !outcomes.contains_key(id))
            .collect();

        self.run_loop(ctx, graph, &cancellation, &mut pending, &mut outcomes, &mut live_ports, &mut pruned_edges)
            .await
    }

    /// Seeds the ready set with `step_id` and lets normal DAG progression
    /// carry downstream (resume-from-step mode, spec §4.2). All upstream
    /// steps are treated as already satisfied via `ctx.injected_outputs`.
    pub async fn execute_from_step(&self, ctx: &mut ExecutionContext, graph: &Graph, step_id: Uuid, step_input: Option<Value>, cancellation: CancellationToken) -> CoreResult<()> {
        let mut outcomes: HashMap<Uuid, StepOutcome> = HashMap::new();
        let mut live_ports: HashMap<Uuid, HashSet<String>> = HashMap::new();
        let mut pruned_edges: HashSet<(Uuid, String, Uuid, String)> = HashSet::new();

        let injected_ids: Vec<Uuid> = ctx.injected_outputs.keys().copied().collect();
        for id in injected_ids {
            if id != step_id {
                outcomes.insert(id, StepOutcome::Completed);
                live_ports.insert(id, [DEFAULT_PORT.to_string()].into_iter().collect());
            }
        }

        self.dispatch_one(ctx, graph, step_id, step_input, &cancellation, &mut outcomes, &mut live_ports, &mut pruned_edges).await?;

        let mut pending: HashSet<Uuid> = graph
            .steps_by_id
            .keys()
            .copied()
            .filter(|id| !outcomes.contains_key(id))
            .collect();

        self.run_loop(ctx, graph, &cancellation, &mut pending, &mut outcomes, &mut live_ports, &mut pruned_edges)
            .await
    }

    /// Single-step mode: bypasses readiness calculation entirely. Creates
    /// exactly one `StepRun`, resolves `step_input` against previously
    /// injected outputs, dispatches, and records output. Does not touch run
    /// status — that is the worker's decision (spec §4.2/§4.6).
    pub async fn execute_single_step(&self, ctx: &mut ExecutionContext, graph: &Graph, step_id: Uuid, step_input: Option<Value>, cancellation: CancellationToken) -> CoreResult<()> {
        let mut outcomes = HashMap::new();
        let mut live_ports = HashMap::new();
        let mut pruned_edges = HashSet::new();
        self.dispatch_one(ctx, graph, step_id, step_input, &cancellation, &mut outcomes, &mut live_ports, &mut pruned_edges).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        ctx: &mut ExecutionContext,
        graph: &Graph,
        cancellation: &CancellationToken,
        pending: &mut HashSet<Uuid>,
        outcomes: &mut HashMap<Uuid, StepOutcome>,
        live_ports: &mut HashMap<Uuid, HashSet<String>>,
        pruned_edges: &mut HashSet<(Uuid, String, Uuid, String)>,
    ) -> CoreResult<()> {
        loop {
            if cancellation.is_cancelled() {
                self.skip_remaining(ctx, graph, pending, outcomes);
                return Err(CoreError::Cancelled("execution cancelled".into()));
            }
            if pending.is_empty() {
                return Ok(());
            }

            // First, cascade-skip anything that has become permanently
            // unreachable (spec §4.2 fan-in: all incoming edges to a
            // required port pruned).
            let newly_unreachable = self.find_unreachable(graph, pending, outcomes, live_ports, pruned_edges);
            for id in newly_unreachable {
                self.skip_step(ctx, graph, id, outcomes, live_ports, pruned_edges);
                pending.remove(&id);
            }
            if pending.is_empty() {
                return Ok(());
            }

            let mut ready: Vec<Uuid> = pending
                .iter()
                .copied()
                .filter(|id| self.is_ready(graph, *id, outcomes, pruned_edges))
                .collect();
            if ready.is_empty() {
                // Nothing ready and nothing pending can ever become ready —
                // shouldn't happen on a validated DAG, but guard anyway.
                self.skip_remaining(ctx, graph, pending, outcomes);
                return Ok(());
            }
            // Tie-break by step name, lexicographic (spec §4.2).
            ready.sort_by(|a, b| graph.steps_by_id[a].name.cmp(&graph.steps_by_id[b].name));

            let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
            let mut joinset: JoinSet<(Uuid, StepRun, CoreResult<AdapterOutcome>)> = JoinSet::new();

            for step_id in &ready {
                pending.remove(step_id);
                let input = self.compute_step_input(ctx, graph, *step_id, outcomes, pruned_edges);
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let prepared = self.prepare_dispatch(ctx, graph, *step_id, input);
                let registry = self.registry.clone();
                let child_cancellation = cancellation.child_token();
                let step_id = *step_id;
                joinset.spawn(async move {
                    let _permit = permit;
                    let (step_run, result) = run_adapter(&registry, prepared, child_cancellation).await;
                    (step_id, step_run, result)
                });
            }

            while let Some(joined) = joinset.join_next().await {
                let (step_id, mut step_run, result) = joined.map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
                match result {
                    Ok(outcome) => {
                        step_run.complete(outcome.output.clone());
                        if let (Some(recorder), Some(usage)) = (&self.usage_recorder, &outcome.usage) {
                            if let Err(e) = recorder.record(usage).await {
                                warn!(error = %e, "failed to record usage");
                            }
                        }
                        let ports: HashSet<String> = outcome
                            .chosen_ports
                            .clone()
                            .unwrap_or_else(|| vec![DEFAULT_PORT.to_string()])
                            .into_iter()
                            .collect();
                        live_ports.insert(step_id, ports);
                        outcomes.insert(step_id, StepOutcome::Completed);
                        ctx.record_step_run(step_run);
                    }
                    Err(err) => {
                        step_run.fail(err.to_string());
                        ctx.record_step_run(step_run);
                        outcomes.insert(step_id, StepOutcome::Failed);

                        if self.has_catch_sibling(graph, step_id) {
                            info!(step_id = %step_id, "step failed inside a try/catch group; continuing");
                            continue;
                        }

                        cancellation.cancel();
                        self.skip_remaining(ctx, graph, pending, outcomes);
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Dispatches one step outside the readiness loop (single-step/resume
    /// seed). Used by `execute_single_step` and the seed step of
    /// `execute_from_step`.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_one(
        &self,
        ctx: &mut ExecutionContext,
        graph: &Graph,
        step_id: Uuid,
        step_input: Option<Value>,
        cancellation: &CancellationToken,
        outcomes: &mut HashMap<Uuid, StepOutcome>,
        live_ports: &mut HashMap<Uuid, HashSet<String>>,
        _pruned_edges: &mut HashSet<(Uuid, String, Uuid, String)>,
    ) -> CoreResult<()> {
        let input = step_input.unwrap_or(Value::Null);
        let prepared = self.prepare_dispatch(ctx, graph, step_id, input);
        let (mut step_run, result) = run_adapter(&self.registry, prepared, cancellation.child_token()).await;

        match result {
            Ok(outcome) => {
                step_run.complete(outcome.output.clone());
                if let (Some(recorder), Some(usage)) = (&self.usage_recorder, &outcome.usage) {
                    recorder.record(usage).await.ok();
                }
                let ports: HashSet<String> = outcome
                    .chosen_ports
                    .unwrap_or_else(|| vec![DEFAULT_PORT.to_string()])
                    .into_iter()
                    .collect();
                live_ports.insert(step_id, ports);
                outcomes.insert(step_id, StepOutcome::Completed);
                ctx.record_step_run(step_run);
                Ok(())
            }
            Err(err) => {
                step_run.fail(err.to_string());
                ctx.record_step_run(step_run);
                outcomes.insert(step_id, StepOutcome::Failed);
                Err(err)
            }
        }
    }

    fn prepare_dispatch(&self, ctx: &mut ExecutionContext, graph: &Graph, step_id: Uuid, input: Value) -> PreparedDispatch {
        let step = graph.steps_by_id[&step_id].clone();
        let sequence_number = ctx.next_sequence();

        let run_input = ctx.run.input.clone().unwrap_or(Value::Null);
        let step_outputs = template::name_keyed_outputs(&graph.steps_by_id, &ctx.step_data);
        let resolve_ctx = ResolveContext {
            input: &run_input,
            variables: &ctx.definition.variables,
            step_outputs_by_name: &step_outputs,
        };
        let resolved_config = template::resolve_value(&step.config, &resolve_ctx);
        let mut resolved_input = template::resolve_value(&input, &resolve_ctx);
        if let Some(key) = &step.idempotency_key {
            if let Value::Object(map) = &mut resolved_input {
                map.insert(IDEMPOTENCY_KEY_FIELD.to_string(), Value::String(key.clone()));
            }
        }

        let step_run = StepRun::new(ctx.run.id, ctx.run.tenant_id, step_id, step.name.clone(), ctx.attempt, sequence_number, Some(resolved_input.clone()));
        let retry = RetryPolicy::from_config(&resolved_config);
        let timeout = step_timeout(&step.kind, &resolved_config);

        PreparedDispatch {
            step_run,
            kind: step.kind,
            config: resolved_config,
            input: resolved_input,
            run_id: ctx.run.id,
            retry,
            timeout,
        }
    }

    /// A step is ready iff every one of its non-pruned incoming edges has a
    /// completed, live-port source, and at least one such edge exists per
    /// the step already being deemed reachable (checked separately by
    /// `find_unreachable`). Entry steps (no incoming edges) are ready
    /// immediately.
    fn is_ready(&self, graph: &Graph, step_id: Uuid, outcomes: &HashMap<Uuid, StepOutcome>, pruned_edges: &HashSet<(Uuid, String, Uuid, String)>) -> bool {
        let incoming = graph.incoming(step_id);
        if incoming.is_empty() {
            return true;
        }
        incoming.iter().all(|edge| {
            if is_pruned(edge, pruned_edges) {
                true
            } else {
                matches!(outcomes.get(&edge.source_step_id), Some(StepOutcome::Completed))
            }
        })
    }

    /// Finds steps that can never become ready: grouped by target port, at
    /// least one port group has every incoming edge pruned or sourced from a
    /// failed/skipped step (spec §4.2 fan-in reachability rule).
    fn find_unreachable(
        &self,
        graph: &Graph,
        pending: &HashSet<Uuid>,
        outcomes: &HashMap<Uuid, StepOutcome>,
        live_ports: &HashMap<Uuid, HashSet<String>>,
        pruned_edges: &mut HashSet<(Uuid, String, Uuid, String)>,
    ) -> Vec<Uuid> {
        // Compute pruning from completed branching steps before checking
        // reachability.
        for (&step_id, ports) in live_ports.iter() {
            for edge in graph.outgoing(step_id) {
                if !ports.contains(&edge.source_port) {
                    pruned_edges.insert(edge_key(edge));
                }
            }
        }

        let mut unreachable = Vec::new();
        for &step_id in pending {
            let incoming = graph.incoming(step_id);
            if incoming.is_empty() {
                continue;
            }
            let mut by_port: HashMap<&str, Vec<&Edge>> = HashMap::new();
            for edge in incoming {
                by_port.entry(edge.target_port.as_str()).or_default().push(edge);
            }
            let dead = by_port.values().any(|edges| {
                edges.iter().all(|edge| {
                    is_pruned(edge, pruned_edges)
                        || matches!(outcomes.get(&edge.source_step_id), Some(StepOutcome::Failed) | Some(StepOutcome::Skipped))
                })
            });
            if dead {
                unreachable.push(step_id);
            }
        }
        unreachable
    }

    fn skip_step(&self, ctx: &mut ExecutionContext, graph: &Graph, step_id: Uuid, outcomes: &mut HashMap<Uuid, StepOutcome>, live_ports: &mut HashMap<Uuid, HashSet<String>>, pruned_edges: &mut HashSet<(Uuid, String, Uuid, String)>) {
        let step = &graph.steps_by_id[&step_id];
        let sequence_number = ctx.next_sequence();
        let step_run = StepRun::skip(ctx.run.id, ctx.run.tenant_id, step_id, step.name.clone(), ctx.attempt, sequence_number);
        ctx.record_step_run(step_run);
        outcomes.insert(step_id, StepOutcome::Skipped);
        live_ports.insert(step_id, HashSet::new());
        for edge in graph.outgoing(step_id) {
            pruned_edges.insert(edge_key(edge));
        }
    }

    fn skip_remaining(&self, ctx: &mut ExecutionContext, graph: &Graph, pending: &mut HashSet<Uuid>, outcomes: &mut HashMap<Uuid, StepOutcome>) {
        let ids: Vec<Uuid> = pending.iter().copied().collect();
        for id in ids {
            let step = &graph.steps_by_id[&id];
            let sequence_number = ctx.next_sequence();
            let step_run = StepRun::skip(ctx.run.id, ctx.run.tenant_id, id, step.name.clone(), ctx.attempt, sequence_number);
            ctx.record_step_run(step_run);
            outcomes.insert(id, StepOutcome::Skipped);
        }
        pending.clear();
    }

    /// Computes a step's resolved input per spec example 1/3: the output of
    /// the single incoming source when there is exactly one, or an object
    /// keyed by source step name when there are several (fan-in merge
    /// input); entry steps get the run's input document.
    fn compute_step_input(&self, ctx: &ExecutionContext, graph: &Graph, step_id: Uuid, outcomes: &HashMap<Uuid, StepOutcome>, pruned_edges: &HashSet<(Uuid, String, Uuid, String)>) -> Value {
        let live_incoming: Vec<&Edge> = graph
            .incoming(step_id)
            .iter()
            .filter(|edge| !is_pruned(edge, pruned_edges) && matches!(outcomes.get(&edge.source_step_id), Some(StepOutcome::Completed)))
            .collect();

        if live_incoming.is_empty() {
            return ctx.run.input.clone().unwrap_or(Value::Null);
        }
        if live_incoming.len() == 1 {
            let edge = live_incoming[0];
            return ctx.output_of(edge.source_step_id).cloned().unwrap_or(Value::Null);
        }
        let mut merged = serde_json::Map::new();
        for edge in live_incoming {
            let name = graph.steps_by_id[&edge.source_step_id].name.clone();
            let output = ctx.output_of(edge.source_step_id).cloned().unwrap_or(Value::Null);
            merged.insert(name, output);
        }
        Value::Object(merged)
    }

    /// Minimal try/catch group support: a failing step whose `group_role` is
    /// `"try"` does not trigger run-level teardown if a sibling in the same
    /// `block_group_id` has `group_role == "catch"`.
    fn has_catch_sibling(&self, graph: &Graph, step_id: Uuid) -> bool {
        let step = &graph.steps_by_id[&step_id];
        if step.group_role.as_deref() != Some("try") {
            return false;
        }
        let Some(group_id) = step.block_group_id else {
            return false;
        };
        graph
            .steps_by_id
            .values()
            .any(|s| s.block_group_id == Some(group_id) && s.group_role.as_deref() == Some("catch"))
    }
}

struct PreparedDispatch {
    step_run: StepRun,
    kind: String,
    config: Value,
    input: Value,
    run_id: Uuid,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

/// A step's wall-clock budget for a single adapter attempt (spec §5): reads
/// `config.timeout_ms` generically, covering e.g. `function.timeout_ms`. The
/// `wait` block's own `duration_ms` doubles as its timeout floor so a wait
/// step is never killed before its own sleep completes.
fn step_timeout(kind: &str, config: &Value) -> Option<Duration> {
    if let Some(ms) = config.get("timeout_ms").and_then(Value::as_u64) {
        return Some(Duration::from_millis(ms));
    }
    if kind == "wait" {
        if let Some(ms) = config.get("duration_ms").and_then(Value::as_u64) {
            return Some(Duration::from_millis(ms + 1_000));
        }
    }
    None
}

/// Dispatches one step, retrying around the adapter call per its
/// `config.retry` policy (bounded attempts, linear backoff) before the step
/// is considered failed. A missing/malformed `retry` means a single
/// dispatch, matching today's no-retry behavior. Always returns the
/// `StepRun` built by `prepare_dispatch` — even on failure — so the caller
/// never has to reconstruct it (and burn a second sequence number) in the
/// error path.
async fn run_adapter(registry: &Registry, prepared: PreparedDispatch, cancellation: CancellationToken) -> (StepRun, CoreResult<AdapterOutcome>) {
    let PreparedDispatch {
        step_run,
        kind,
        config,
        input,
        run_id,
        retry,
        timeout,
    } = prepared;

    let adapter = match registry.get(&kind) {
        Ok(adapter) => adapter,
        Err(err) => return (step_run, Err(err)),
    };
    let adapter_ctx = AdapterContext {
        run_id,
        step_id: step_run.step_id,
        step_name: step_run.step_name.clone(),
        attempt: step_run.attempt,
        cancellation: cancellation.clone(),
    };

    if let Err(err) = adapter.validate(&config) {
        return (step_run, Err(err));
    }
    let max_attempts = retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);

    let mut last_err = None;
    for attempt in 1..=max_attempts {
        if cancellation.is_cancelled() {
            return (step_run, Err(CoreError::Cancelled("execution cancelled".into())));
        }
        let attempt_result = match timeout {
            Some(duration) => match tokio::time::timeout(duration, adapter.execute(&adapter_ctx, &config, &input)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout {
                    step_id: step_run.step_id,
                    step_name: step_run.step_name.clone(),
                    duration_ms: duration.as_millis() as u64,
                }),
            },
            None => adapter.execute(&adapter_ctx, &config, &input).await,
        };
        match attempt_result {
            Ok(outcome) => return (step_run, Ok(outcome)),
            Err(err) => {
                warn!(step_id = %step_run.step_id, attempt, max_attempts, error = %err, "adapter dispatch failed");
                let retryable = !matches!(err, CoreError::Timeout { .. });
                last_err = Some(err);
                if attempt < max_attempts && retryable {
                    tokio::time::sleep(retry.expect("retry set when max_attempts > 1").backoff()).await;
                } else if !retryable {
                    break;
                }
            }
        }
    }
    (step_run, Err(last_err.expect("loop runs at least once")))
}

fn edge_key(edge: &Edge) -> (Uuid, String, Uuid, String) {
    (edge.source_step_id, edge.source_port.clone(), edge.target_step_id, edge.target_port.clone())
}

fn is_pruned(edge: &Edge, pruned_edges: &HashSet<(Uuid, String, Uuid, String)>) -> bool {
    pruned_edges.contains(&edge_key(edge))
}

/// Computes the run's terminal output from a completed full run (spec
/// §4.2's "terminal-output selection"): the outputs of terminal steps — a
/// single value if there's exactly one terminal step, otherwise an object
/// keyed by terminal step id; falls back to any recorded step output if
/// there are no terminal steps at all.
pub fn terminal_output(ctx: &ExecutionContext, graph: &Graph) -> Value {
    let terminals = graph.terminal_steps();
    let mut outputs: Vec<(Uuid, Value)> = terminals
        .into_iter()
        .filter_map(|id| ctx.output_of(id).cloned().map(|v| (id, v)))
        .collect();

    if outputs.is_empty() {
        return ctx
            .step_runs
            .iter()
            .rev()
            .find_map(|sr| sr.output.clone())
            .unwrap_or(json!({}));
    }
    if outputs.len() == 1 {
        return outputs.remove(0).1;
    }
    let mut map = serde_json::Map::new();
    for (id, value) in outputs {
        map.insert(id.to_string(), value);
    }
    Value::Object(map)
}
