//! C8 — worker loop.
//!
//! Per iteration: dequeue with a short timeout, fetch the run, choose a
//! definition source (current project for `full`, versioned snapshot for
//! `single_step`/`resume` with fallback to current if the version is
//! missing), build the execution context, dispatch by mode, persist every
//! step-run, and update the run's terminal state (spec §4.7).
//!
//! Shutdown follows the teacher's `main.rs` `tokio::main` + `tracing` wiring
//! generalized into a long-running loop; SIGINT/SIGTERM handling is the
//! standard `tokio::signal::ctrl_c` idiom (no single pack repo shows this
//! exact pattern, so it is grounded directly in `tokio`, already a teacher
//! dependency, rather than invented from scratch).

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::Registry;
use crate::context::ExecutionContext;
use crate::error::{CoreError, CoreResult};
use crate::executor::{self, Executor};
use crate::graph::Graph;
use crate::model::{ExecutionMode, ProjectDefinition, RunStatus};
use crate::queue::{Job, JobQueue};
use crate::store::{self, DefinitionStore};

/// How long a single dequeue call blocks before the loop re-checks for
/// shutdown (spec §4.7: "a small timeout (≈5 s)").
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the loop sleeps after shutdown is requested, to let in-flight
/// IO drain (spec §4.7).
const DRAIN_DELAY: Duration = Duration::from_millis(250);

pub struct Worker {
    store: DefinitionStore,
    queue: JobQueue,
    executor: Executor,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(store: DefinitionStore, queue: JobQueue, registry: Registry) -> Self {
        Self {
            store,
            queue,
            executor: Executor::new(registry),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// A clone of the worker's shutdown token — wire this up to
    /// `tokio::signal::ctrl_c()` (or a SIGTERM handler) from the caller.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until `shutdown_handle()` is cancelled. Each iteration dequeues
    /// at most one job; queue-transport errors are logged and the loop
    /// continues (spec §7: "queue-level dequeue errors cause the iteration
    /// to log and continue, not crash").
    pub async fn run(&self) -> CoreResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                info!("worker shutdown requested; draining");
                tokio::time::sleep(DRAIN_DELAY).await;
                return Ok(());
            }

            let job = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("worker shutdown requested; draining");
                    tokio::time::sleep(DRAIN_DELAY).await;
                    return Ok(());
                }
                dequeued = self.queue.dequeue(DEQUEUE_TIMEOUT) => dequeued,
            };

            match job {
                Ok(Some(job)) => {
                    let job_id = job.id.clone();
                    if let Err(err) = self.handle_job(job).await {
                        error!(job_id, error = %err, "job failed");
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "dequeue failed; continuing");
                    continue;
                }
            }
        }
    }

    async fn handle_job(&self, job: Job) -> CoreResult<()> {
        let tenant_id = store::resolve_project_tenant(job.tenant_id, job.project_tenant_id);
        let run = self.store.get_run(job.tenant_id, job.run_id).await?;

        // At-least-once queue delivery means this job may be a redelivery of
        // one already executed to completion. A full-DAG run is only ever
        // executed once to terminal status; re-running it would append a
        // fresh attempt's worth of step-runs and overwrite the recorded
        // output (spec §4.7/§8: "do not re-run a completed run").
        // Single-step/resume jobs are deliberately re-executable (that is
        // their whole purpose), so the guard only applies to `full`.
        if job.execution_mode == ExecutionMode::Full && run.status == RunStatus::Completed {
            warn!(run_id = %run.id, "redelivered full job for an already-completed run; skipping");
            return Ok(());
        }

        let mut definition = self.load_definition(&job, tenant_id).await?;
        if let Some(step_id) = job.target_step_id {
            self.recover_step_if_missing(&mut definition, tenant_id, job.project_id, step_id).await?;
        }

        let blocks = self.store.load_block_catalog().await?;
        let graph = Graph::build(&definition, &blocks)?;

        let attempt = self.store.get_max_attempt(run.id).await? + 1;
        let sequence_high_water = self.store.get_max_sequence(run.id).await?;

        let mut ctx = ExecutionContext::new(run, definition, attempt, sequence_high_water)
            .with_injected_outputs(job.injected_outputs.clone().unwrap_or_default());

        let cancellation = self.shutdown.child_token();
        let outcome = self.dispatch(&mut ctx, &graph, &job, cancellation).await;

        for step_run in &ctx.step_runs {
            self.store.create_step_run(step_run).await?;
        }

        self.finish_run(&mut ctx, &graph, &job, outcome);
        self.store.update_run(&ctx.run).await?;
        Ok(())
    }

    async fn load_definition(&self, job: &Job, tenant_id: Uuid) -> CoreResult<ProjectDefinition> {
        if !store::wants_versioned_snapshot(job.execution_mode) {
            return self.store.get_project_with_graph(tenant_id, job.project_id).await;
        }

        match self.store.get_project_version(job.project_id, job.project_version).await? {
            Some(pv) => Ok(ProjectDefinition::from_version(pv, tenant_id)),
            None => {
                warn!(project_id = %job.project_id, version = job.project_version, "versioned snapshot missing; falling back to current project");
                self.store.get_project_with_graph(tenant_id, job.project_id).await
            }
        }
    }

    /// Single-step step-recovery rule (spec §4.7): if the target step is
    /// absent from the loaded (versioned) definition, look it up in the
    /// current project and splice it — and any edges touching it whose
    /// other endpoint is already present — into the working definition.
    async fn recover_step_if_missing(&self, definition: &mut ProjectDefinition, tenant_id: Uuid, project_id: Uuid, step_id: Uuid) -> CoreResult<()> {
        if definition.steps.iter().any(|s| s.id == step_id) {
            return Ok(());
        }

        info!(step_id = %step_id, "target step missing from definition; recovering from current project");
        let current = self.store.get_project_with_graph(tenant_id, project_id).await?;
        let Some(step) = current.steps.iter().find(|s| s.id == step_id).cloned() else {
            return Err(CoreError::StepNotFound(step_id));
        };

        let present: std::collections::HashSet<Uuid> = definition.steps.iter().map(|s| s.id).chain(std::iter::once(step_id)).collect();
        definition.steps.push(step);
        for edge in &current.edges {
            let touches_step = edge.source_step_id == step_id || edge.target_step_id == step_id;
            let both_present = present.contains(&edge.source_step_id) && present.contains(&edge.target_step_id);
            if touches_step && both_present && !definition.edges.iter().any(|e| e.source_step_id == edge.source_step_id && e.source_port == edge.source_port && e.target_step_id == edge.target_step_id && e.target_port == edge.target_port) {
                definition.edges.push(edge.clone());
            }
        }
        Ok(())
    }

    async fn dispatch(&self, ctx: &mut ExecutionContext, graph: &Graph, job: &Job, cancellation: CancellationToken) -> CoreResult<()> {
        if ctx.run.started_at.is_none() && !ctx.run.is_terminal() {
            ctx.run.start();
        }

        match job.execution_mode {
            ExecutionMode::Full => self.executor.execute(ctx, graph, cancellation).await,
            ExecutionMode::SingleStep => {
                let step_id = job.target_step_id.ok_or_else(|| CoreError::Validation("single_step job missing target_step_id".into()))?;
                self.executor.execute_single_step(ctx, graph, step_id, job.step_input.clone(), cancellation).await
            }
            ExecutionMode::Resume => {
                let step_id = job.target_step_id.ok_or_else(|| CoreError::Validation("resume job missing target_step_id".into()))?;
                self.executor.execute_from_step(ctx, graph, step_id, job.step_input.clone(), cancellation).await
            }
        }
    }

    /// Per Open Question #1 (DESIGN.md): single-step mode also updates run
    /// status from the step's own outcome, not just full/resume runs.
    fn finish_run(&self, ctx: &mut ExecutionContext, graph: &Graph, job: &Job, outcome: CoreResult<()>) {
        match outcome {
            Ok(()) => {
                let output = match job.execution_mode {
                    ExecutionMode::SingleStep => ctx.step_runs.last().and_then(|sr| sr.output.clone()).unwrap_or(Value::Null),
                    _ => executor::terminal_output(ctx, graph),
                };
                ctx.run.complete(output);
            }
            Err(CoreError::Cancelled(reason)) => ctx.run.cancel(reason),
            Err(err) => ctx.run.fail(err.to_string()),
        }
    }
}
