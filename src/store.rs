//! C9 — definition store: project/run/step-run persistence over Postgres.
//!
//! Every multi-tenant query filters `tenant_id` and `deleted_at IS NULL`
//! except system-project reads, which resolve under `SYSTEM_TENANT_ID`
//! directly (spec §3/§4.9/§6). Table DDL style, `ON CONFLICT DO UPDATE`, and
//! `FromRow` row structs follow
//! `examples/other_examples/..._n8n-rs__..._pg_store.rs` closely.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    BlockDefinition, Edge, ExecutionMode, Project, ProjectDefinition, ProjectStatus,
    ProjectVersion, Run, RunStatus, Step, StepRun, StepRunStatus,
};

#[derive(Clone)]
pub struct DefinitionStore {
    pool: PgPool,
}

impl DefinitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id UUID NOT NULL,
                tenant_id UUID NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                variables JSONB NOT NULL DEFAULT '{}'::jsonb,
                status TEXT NOT NULL DEFAULT 'draft',
                version BIGINT NOT NULL DEFAULT 1,
                has_draft BOOLEAN NOT NULL DEFAULT false,
                deleted_at TIMESTAMPTZ,
                PRIMARY KEY (tenant_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                config JSONB NOT NULL DEFAULT '{}'::jsonb,
                block_group_id UUID,
                group_role TEXT,
                idempotency_key TEXT,
                position_x DOUBLE PRECISION NOT NULL DEFAULT 0,
                position_y DOUBLE PRECISION NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS edges (
                source_step_id UUID NOT NULL,
                source_port TEXT NOT NULL DEFAULT 'default',
                target_step_id UUID NOT NULL,
                target_port TEXT NOT NULL DEFAULT 'default'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_versions (
                project_id UUID NOT NULL,
                version BIGINT NOT NULL,
                definition JSONB NOT NULL,
                PRIMARY KEY (project_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS block_definitions (
                slug TEXT PRIMARY KEY,
                tenant_id UUID,
                definition JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS block_versions (
                slug TEXT NOT NULL,
                version BIGINT NOT NULL,
                definition JSONB NOT NULL,
                PRIMARY KEY (slug, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id UUID PRIMARY KEY,
                tenant_id UUID NOT NULL,
                project_id UUID NOT NULL,
                project_version BIGINT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                run_number BIGINT NOT NULL,
                input JSONB,
                output JSONB,
                error TEXT,
                triggered_by TEXT,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_runs (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                tenant_id UUID NOT NULL,
                step_id UUID NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt BIGINT NOT NULL,
                sequence_number BIGINT NOT NULL,
                input JSONB,
                output JSONB,
                error TEXT,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads a project's current (live) definition plus its steps/edges,
    /// enforcing tenant isolation and soft-delete filtering unless
    /// `tenant_id` is the system tenant.
    pub async fn get_project_with_graph(&self, tenant_id: Uuid, project_id: Uuid) -> CoreResult<ProjectDefinition> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, tenant_id, name, description, variables, status, version, has_draft, deleted_at
            FROM projects
            WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(project_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CoreError::ProjectNotFound(project_id))?;

        let steps = sqlx::query_as::<_, StepRow>(
            "SELECT id, project_id, name, kind, config, block_group_id, group_role, idempotency_key, position_x, position_y FROM steps WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StepRow::into_model)
        .collect();

        let edges = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT e.source_step_id, e.source_port, e.target_step_id, e.target_port
            FROM edges e
            JOIN steps s ON s.id = e.source_step_id
            WHERE s.project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(EdgeRow::into_model)
        .collect();

        Ok(ProjectDefinition {
            project_id: row.id,
            tenant_id: row.tenant_id,
            version: row.version,
            name: row.name,
            variables: serde_json::from_value(row.variables).unwrap_or_default(),
            steps,
            edges,
        })
    }

    /// Loads an immutable versioned snapshot (spec §4.9). Snapshots carry no
    /// tenant of their own — the caller supplies the tenant the job was
    /// dispatched under.
    pub async fn get_project_version(&self, project_id: Uuid, version: i64) -> CoreResult<Option<ProjectVersion>> {
        let row = sqlx::query_as::<_, ProjectVersionRow>(
            "SELECT project_id, version, definition FROM project_versions WHERE project_id = $1 AND version = $2",
        )
        .bind(project_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(serde_json::from_value(r.definition).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?),
            None => None,
        })
    }

    pub async fn save_project_version(&self, pv: &ProjectVersion) -> CoreResult<()> {
        let definition = serde_json::to_value(pv).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(
            r#"
            INSERT INTO project_versions (project_id, version, definition)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id, version) DO UPDATE SET definition = EXCLUDED.definition
            "#,
        )
        .bind(pv.project_id)
        .bind(pv.version)
        .bind(definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_project(&self, project: &Project) -> CoreResult<()> {
        let variables = serde_json::to_value(&project.variables).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(
            r#"
            INSERT INTO projects (id, tenant_id, name, description, variables, status, version, has_draft, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                variables = EXCLUDED.variables,
                status = EXCLUDED.status,
                version = EXCLUDED.version,
                has_draft = EXCLUDED.has_draft
            "#,
        )
        .bind(project.id)
        .bind(project.tenant_id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(variables)
        .bind(status_to_str(project.status))
        .bind(project.version)
        .bind(project.has_draft)
        .bind(project.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_step(&self, step: &Step) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO steps (id, project_id, name, kind, config, block_group_id, group_role, idempotency_key, position_x, position_y)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                project_id = EXCLUDED.project_id,
                name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                config = EXCLUDED.config,
                block_group_id = EXCLUDED.block_group_id,
                group_role = EXCLUDED.group_role,
                idempotency_key = EXCLUDED.idempotency_key,
                position_x = EXCLUDED.position_x,
                position_y = EXCLUDED.position_y
            "#,
        )
        .bind(step.id)
        .bind(step.project_id)
        .bind(&step.name)
        .bind(&step.kind)
        .bind(&step.config)
        .bind(step.block_group_id)
        .bind(&step.group_role)
        .bind(&step.idempotency_key)
        .bind(step.position.0)
        .bind(step.position.1)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replaces every edge sourced from `project_id`'s steps with `edges`.
    /// The `edges` table has no natural key to upsert against, so this does
    /// a delete-then-insert inside one transaction rather than a row-by-row
    /// `ON CONFLICT`.
    pub async fn replace_edges_for_project(&self, project_id: Uuid, edges: &[Edge]) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM edges
            WHERE source_step_id IN (SELECT id FROM steps WHERE project_id = $1)
            "#,
        )
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

        for edge in edges {
            sqlx::query(
                r#"
                INSERT INTO edges (source_step_id, source_port, target_step_id, target_port)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(edge.source_step_id)
            .bind(&edge.source_port)
            .bind(edge.target_step_id)
            .bind(&edge.target_port)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn create_run(&self, run: &Run) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, tenant_id, project_id, project_version, status, run_number, input, output, error, triggered_by, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(run.tenant_id)
        .bind(run.project_id)
        .bind(run.project_version)
        .bind(run_status_to_str(run.status))
        .bind(run.run_number)
        .bind(&run.input)
        .bind(&run.output)
        .bind(&run.error)
        .bind(&run.triggered_by)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates a run's terminal state. Filters on `tenant_id` (the run's own,
    /// already loaded via `get_run`) so a write can never cross into another
    /// tenant's row (spec §4.9).
    pub async fn update_run(&self, run: &Run) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE runs SET
                status = $1, output = $2, error = $3, started_at = $4, completed_at = $5
            WHERE id = $6 AND tenant_id = $7
            "#,
        )
        .bind(run_status_to_str(run.status))
        .bind(&run.output)
        .bind(&run.error)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.id)
        .bind(run.tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads a run, filtered by the tenant that dispatched the job (spec
    /// §4.9: all multi-tenant reads/writes require `tenant_id` filtering).
    pub async fn get_run(&self, tenant_id: Uuid, run_id: Uuid) -> CoreResult<Run> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, tenant_id, project_id, project_version, status, run_number, input, output, error, triggered_by, started_at, completed_at
            FROM runs WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CoreError::RunNotFound(run_id))?;
        Ok(row.into_model())
    }

    pub async fn create_step_run(&self, step_run: &StepRun) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO step_runs (id, run_id, tenant_id, step_id, step_name, status, attempt, sequence_number, input, output, error, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(step_run.id)
        .bind(step_run.run_id)
        .bind(step_run.tenant_id)
        .bind(step_run.step_id)
        .bind(&step_run.step_name)
        .bind(step_run_status_to_str(step_run.status))
        .bind(step_run.attempt)
        .bind(step_run.sequence_number)
        .bind(&step_run.input)
        .bind(&step_run.output)
        .bind(&step_run.error)
        .bind(step_run.started_at)
        .bind(step_run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_max_attempt(&self, run_id: Uuid) -> CoreResult<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(attempt) FROM step_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0))
    }

    pub async fn get_max_sequence(&self, run_id: Uuid) -> CoreResult<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence_number) FROM step_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0))
    }

    pub async fn upsert_block(&self, block: &BlockDefinition) -> CoreResult<()> {
        let definition = serde_json::to_value(block).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(
            r#"
            INSERT INTO block_definitions (slug, tenant_id, definition, version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (slug) DO UPDATE SET definition = EXCLUDED.definition, version = EXCLUDED.version
            "#,
        )
        .bind(&block.slug)
        .bind(block.tenant_id)
        .bind(definition)
        .bind(block.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_block(&self, slug: &str) -> CoreResult<Option<BlockDefinition>> {
        let row = sqlx::query_as::<_, BlockRow>("SELECT slug, tenant_id, definition, version FROM block_definitions WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(serde_json::from_value(r.definition).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?),
            None => None,
        })
    }

    pub async fn save_block_version(&self, bv: &BlockVersionRecord) -> CoreResult<()> {
        let definition = serde_json::to_value(&bv.definition).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(
            r#"
            INSERT INTO block_versions (slug, version, definition)
            VALUES ($1, $2, $3)
            ON CONFLICT (slug, version) DO UPDATE SET definition = EXCLUDED.definition
            "#,
        )
        .bind(&bv.slug)
        .bind(bv.version)
        .bind(definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads every block definition currently enabled, keyed by slug — the
    /// lookup table `Graph::build` validates against.
    pub async fn load_block_catalog(&self) -> CoreResult<HashMap<String, BlockDefinition>> {
        let rows = sqlx::query_as::<_, BlockRow>("SELECT slug, tenant_id, definition, version FROM block_definitions").fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let def: BlockDefinition = serde_json::from_value(row.definition).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
            out.insert(row.slug, def);
        }
        Ok(out)
    }
}

/// A `BlockVersion` plus its definition — kept separate from
/// `model::BlockVersion` so the store can serialize the full definition
/// without the model crate depending on storage-only wrapper types.
pub struct BlockVersionRecord {
    pub slug: String,
    pub version: i64,
    pub definition: BlockDefinition,
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    description: Option<String>,
    variables: Value,
    status: String,
    version: i64,
    has_draft: bool,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    kind: String,
    config: Value,
    block_group_id: Option<Uuid>,
    group_role: Option<String>,
    idempotency_key: Option<String>,
    position_x: f64,
    position_y: f64,
}

impl StepRow {
    fn into_model(self) -> Step {
        Step {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            kind: self.kind,
            config: self.config,
            block_group_id: self.block_group_id,
            group_role: self.group_role,
            idempotency_key: self.idempotency_key,
            position: (self.position_x, self.position_y),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    source_step_id: Uuid,
    source_port: String,
    target_step_id: Uuid,
    target_port: String,
}

impl EdgeRow {
    fn into_model(self) -> Edge {
        Edge {
            source_step_id: self.source_step_id,
            source_port: self.source_port,
            target_step_id: self.target_step_id,
            target_port: self.target_port,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProjectVersionRow {
    #[allow(dead_code)]
    project_id: Uuid,
    #[allow(dead_code)]
    version: i64,
    definition: Value,
}

#[derive(sqlx::FromRow)]
struct BlockRow {
    slug: String,
    #[allow(dead_code)]
    tenant_id: Option<Uuid>,
    definition: Value,
    #[allow(dead_code)]
    version: i64,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    tenant_id: Uuid,
    project_id: Uuid,
    project_version: i64,
    status: String,
    run_number: i64,
    input: Option<Value>,
    output: Option<Value>,
    error: Option<String>,
    triggered_by: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn into_model(self) -> Run {
        Run {
            id: self.id,
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            project_version: self.project_version,
            status: str_to_run_status(&self.status),
            run_number: self.run_number,
            input: self.input,
            output: self.output,
            error: self.error,
            triggered_by: self.triggered_by,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

fn status_to_str(s: ProjectStatus) -> &'static str {
    match s {
        ProjectStatus::Draft => "draft",
        ProjectStatus::Published => "published",
    }
}

fn run_status_to_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn str_to_run_status(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Pending,
    }
}

fn step_run_status_to_str(s: StepRunStatus) -> &'static str {
    match s {
        StepRunStatus::Pending => "pending",
        StepRunStatus::Running => "running",
        StepRunStatus::Completed => "completed",
        StepRunStatus::Failed => "failed",
        StepRunStatus::Skipped => "skipped",
    }
}

/// Resolves which tenant a job's project should be loaded under (spec
/// §4.7): the job's own `project_tenant_id` override when present
/// (system-tenant projects), else the job's `tenant_id`.
pub fn resolve_project_tenant(job_tenant_id: Uuid, project_tenant_id: Option<Uuid>) -> Uuid {
    project_tenant_id.unwrap_or(job_tenant_id)
}

/// Picks the definition source for a job's execution mode, per spec §4.7:
/// the current project for `full`, a versioned snapshot for
/// `single_step`/`resume` (falling back to current if the version is
/// missing).
pub fn wants_versioned_snapshot(mode: ExecutionMode) -> bool {
    matches!(mode, ExecutionMode::SingleStep | ExecutionMode::Resume)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_tenant_override_takes_precedence() {
        let job_tenant = Uuid::new_v4();
        let system = crate::model::SYSTEM_TENANT_ID;
        assert_eq!(resolve_project_tenant(job_tenant, Some(system)), system);
        assert_eq!(resolve_project_tenant(job_tenant, None), job_tenant);
    }

    #[test]
    fn only_single_step_and_resume_want_a_snapshot() {
        assert!(!wants_versioned_snapshot(ExecutionMode::Full));
        assert!(wants_versioned_snapshot(ExecutionMode::SingleStep));
        assert!(wants_versioned_snapshot(ExecutionMode::Resume));
    }
}
