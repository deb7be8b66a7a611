//! C7 — Redis-backed job queue.
//!
//! A FIFO over a single well-known Redis list key: `Enqueue` is `LPUSH`,
//! `Dequeue` is a blocking `BRPOP` with a caller-supplied timeout (spec
//! §4.7/§6). Delivery is at-least-once — the worker must treat re-delivery
//! as possible and rely on run-state checks rather than queue semantics for
//! exactly-once behavior.
//!
//! Grounded on `examples/other_examples/manifests/sattyamjjain-ferrumdeck`
//! and `ka2kama-ringiflow` (`redis` + `tokio-comp` alongside a `sqlx`+`tokio`
//! stack matching this crate's shape); the queue/job shape itself follows
//! spec.md directly since no pack repo implements this exact contract.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::ExecutionMode;

/// Default Redis list key jobs are pushed to and popped from.
pub const DEFAULT_QUEUE_KEY: &str = "workflow_core:jobs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub project_version: i64,
    /// Present for system-tenant projects: the worker loads the project
    /// under this tenant rather than `tenant_id` (spec §4.7).
    pub project_tenant_id: Option<Uuid>,
    pub execution_mode: ExecutionMode,
    pub target_step_id: Option<Uuid>,
    pub step_input: Option<Value>,
    pub injected_outputs: Option<std::collections::HashMap<Uuid, Value>>,
}

impl Job {
    pub fn full(tenant_id: Uuid, run_id: Uuid, project_id: Uuid, project_version: i64) -> Self {
        Self {
            id: Ulid::new().to_string(),
            tenant_id,
            run_id,
            project_id,
            project_version,
            project_tenant_id: None,
            execution_mode: ExecutionMode::Full,
            target_step_id: None,
            step_input: None,
            injected_outputs: None,
        }
    }

    pub fn single_step(tenant_id: Uuid, run_id: Uuid, project_id: Uuid, project_version: i64, step_id: Uuid, step_input: Option<Value>, injected_outputs: std::collections::HashMap<Uuid, Value>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            tenant_id,
            run_id,
            project_id,
            project_version,
            project_tenant_id: None,
            execution_mode: ExecutionMode::SingleStep,
            target_step_id: Some(step_id),
            step_input,
            injected_outputs: Some(injected_outputs),
        }
    }

    pub fn resume(tenant_id: Uuid, run_id: Uuid, project_id: Uuid, project_version: i64, step_id: Uuid, step_input: Option<Value>, injected_outputs: std::collections::HashMap<Uuid, Value>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            tenant_id,
            run_id,
            project_id,
            project_version,
            project_tenant_id: None,
            execution_mode: ExecutionMode::Resume,
            target_step_id: Some(step_id),
            step_input,
            injected_outputs: Some(injected_outputs),
        }
    }

    pub fn with_system_tenant(mut self, project_tenant_id: Uuid) -> Self {
        self.project_tenant_id = Some(project_tenant_id);
        self
    }
}

/// Redis list-backed FIFO. `Clone` is cheap — `ConnectionManager` is itself
/// an `Arc`-backed handle that reconnects transparently.
#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
    key: String,
}

impl JobQueue {
    pub async fn connect(redis_url: &str) -> CoreResult<Self> {
        Self::connect_with_key(redis_url, DEFAULT_QUEUE_KEY).await
    }

    pub async fn connect_with_key(redis_url: &str, key: impl Into<String>) -> CoreResult<Self> {
        let client = redis::Client::open(redis_url).map_err(CoreError::Redis)?;
        let conn = client.get_connection_manager().await.map_err(CoreError::Redis)?;
        Ok(Self { conn, key: key.into() })
    }

    pub async fn enqueue(&self, job: &Job) -> CoreResult<()> {
        let payload = serde_json::to_string(job).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(&self.key, payload).await.map_err(CoreError::Redis)?;
        Ok(())
    }

    /// Blocks up to `timeout` for a job. Returns `None` on timeout, `Err` on
    /// transport failure (spec §4.7).
    pub async fn dequeue(&self, timeout: Duration) -> CoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let timeout_secs = timeout.as_secs_f64().max(0.0);
        let reply: Option<(String, String)> = conn
            .brpop(&self.key, timeout_secs)
            .await
            .map_err(CoreError::Redis)?;

        match reply {
            None => Ok(None),
            Some((_key, payload)) => {
                let job: Job = serde_json::from_str(&payload).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
                Ok(Some(job))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::single_step(
            Uuid::nil(),
            Uuid::nil(),
            Uuid::nil(),
            3,
            Uuid::nil(),
            Some(json!({"value": 7})),
            std::collections::HashMap::new(),
        );
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.execution_mode, job.execution_mode);
        assert_eq!(decoded.target_step_id, job.target_step_id);
    }

    #[test]
    fn system_tenant_marker_round_trips() {
        let system_id = crate::model::SYSTEM_TENANT_ID;
        let job = Job::full(Uuid::nil(), Uuid::nil(), Uuid::nil(), 1).with_system_tenant(system_id);
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.project_tenant_id, Some(system_id));
    }
}
