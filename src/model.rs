//! Core data model: projects, steps, edges, block definitions, runs and
//! step-runs. Mirrors the persisted shape in `store.rs` but stays storage
//! agnostic — these types are plain data, not sqlx rows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved tenant id shared by system-owned catalog entries and projects.
pub const SYSTEM_TENANT_ID: Uuid = Uuid::from_u128(1);

pub fn is_system_tenant(tenant_id: Uuid) -> bool {
    tenant_id == SYSTEM_TENANT_ID
}

/// Default port name used when an edge or block port is left unspecified.
pub const DEFAULT_PORT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Published,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub status: ProjectStatus,
    pub version: i64,
    pub has_draft: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// Block catalog slug this step is bound to.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    pub block_group_id: Option<Uuid>,
    pub group_role: Option<String>,
    /// Threaded into resolved input under a reserved key before dispatch, so
    /// adapters that care (e.g. `http`) may de-duplicate re-executions.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub position: (f64, f64),
}

/// Reserved input key a step's `idempotency_key` is threaded under before
/// dispatch (only set when the step declares one).
pub const IDEMPOTENCY_KEY_FIELD: &str = "_idempotency_key";

/// Per-step retry policy, read from `config.retry`. Mirrors the teacher's
/// `RetryPolicy { max_attempts, backoff_seconds }` shape.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

fn default_backoff_seconds() -> u64 {
    5
}

impl RetryPolicy {
    /// Reads an optional `retry: { max_attempts, backoff_seconds }` object
    /// out of a step's opaque config. Absent or malformed `retry` means no
    /// retrying — a step dispatches exactly once.
    pub fn from_config(config: &Value) -> Option<Self> {
        let retry = config.get("retry")?;
        serde_json::from_value(retry.clone()).ok()
    }

    /// Linear backoff: the same delay before every retry (teacher's
    /// `backoff_seconds` is a flat delay, not exponential).
    pub fn backoff(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.backoff_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source_step_id: Uuid,
    #[serde(default = "default_port")]
    pub source_port: String,
    pub target_step_id: Uuid,
    #[serde(default = "default_port")]
    pub target_port: String,
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPort {
    pub name: String,
    pub is_default: bool,
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub slug: String,
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub input_ports: Vec<String>,
    #[serde(default)]
    pub output_ports: Vec<OutputPort>,
    #[serde(default)]
    pub config_schema: Option<Value>,
    pub category: String,
    pub enabled: bool,
    pub version: i64,
}

impl BlockDefinition {
    /// A block with no declared output ports is data-driven (its live ports
    /// depend on runtime config, e.g. `switch`'s `cases` or `router`'s
    /// `route_key`) — any port name is accepted. Otherwise the port must be
    /// one of the declared ones.
    pub fn has_output_port(&self, port: &str) -> bool {
        self.output_ports.is_empty() || self.output_ports.iter().any(|p| p.name == port)
    }

    pub fn has_input_port(&self, port: &str) -> bool {
        port == DEFAULT_PORT || self.input_ports.iter().any(|p| p == port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Full,
    SingleStep,
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub project_version: i64,
    pub status: RunStatus,
    pub run_number: i64,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub triggered_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(tenant_id: Uuid, project_id: Uuid, project_version: i64, run_number: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            project_id,
            project_version,
            status: RunStatus::Pending,
            run_number,
            input: None,
            output: None,
            error: None,
            triggered_by: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// `pending -> running`.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// `running -> completed`.
    pub fn complete(&mut self, output: Value) {
        self.status = RunStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// `running -> failed`.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// any non-terminal -> `cancelled`.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Cancelled;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub status: StepRunStatus,
    pub attempt: i64,
    pub sequence_number: i64,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn new(
        run_id: Uuid,
        tenant_id: Uuid,
        step_id: Uuid,
        step_name: impl Into<String>,
        attempt: i64,
        sequence_number: i64,
        input: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            tenant_id,
            step_id,
            step_name: step_name.into(),
            status: StepRunStatus::Running,
            attempt,
            sequence_number,
            input,
            output: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    pub fn complete(&mut self, output: Value) {
        self.status = StepRunStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepRunStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(run_id: Uuid, tenant_id: Uuid, step_id: Uuid, step_name: impl Into<String>, attempt: i64, sequence_number: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            tenant_id,
            step_id,
            step_name: step_name.into(),
            status: StepRunStatus::Skipped,
            attempt,
            sequence_number,
            input: None,
            output: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
        }
    }
}

/// Immutable snapshot of a project's definition, addressed by
/// `(project_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectVersion {
    pub project_id: Uuid,
    pub version: i64,
    pub name: String,
    pub description: Option<String>,
    pub variables: HashMap<String, Value>,
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
}

/// Immutable snapshot of a block definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVersion {
    pub slug: String,
    pub version: i64,
    pub definition: BlockDefinition,
}

/// A fully loaded project definition: header fields plus steps/edges,
/// sourced either from the live `projects`/`steps`/`edges` tables (current)
/// or from a `ProjectVersion` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub project_id: Uuid,
    pub tenant_id: Uuid,
    pub version: i64,
    pub name: String,
    pub variables: HashMap<String, Value>,
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
}

impl ProjectDefinition {
    /// Builds a definition from a versioned snapshot plus the tenant it was
    /// loaded under (a snapshot carries no tenant of its own).
    pub fn from_version(pv: ProjectVersion, tenant_id: Uuid) -> Self {
        Self {
            project_id: pv.project_id,
            tenant_id,
            version: pv.version,
            name: pv.name,
            variables: pv.variables,
            steps: pv.steps,
            edges: pv.edges,
        }
    }
}
