//! C6 — usage recorder.
//!
//! Optional collaborator invoked by LLM-family adapters on completion.
//! Records `(run_id, step_id, model, input_tokens, output_tokens, cost_usd,
//! ts)` rows; aggregates are consumed by a billing/budget surface that is
//! not part of this core (spec §4.8).
//!
//! Row shape and `INSERT`/aggregate-query style follow
//! `other_examples/..._n8n-rs__..._pg_store.rs`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub ts: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(run_id: Uuid, step_id: Uuid, model: impl Into<String>, input_tokens: i64, output_tokens: i64, cost_usd: f64) -> Self {
        Self {
            run_id,
            step_id,
            model,
            input_tokens,
            output_tokens,
            cost_usd,
            ts: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    pool: PgPool,
}

impl UsageRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                id BIGSERIAL PRIMARY KEY,
                run_id UUID NOT NULL,
                step_id UUID NOT NULL,
                model TEXT NOT NULL,
                input_tokens BIGINT NOT NULL,
                output_tokens BIGINT NOT NULL,
                cost_usd DOUBLE PRECISION NOT NULL,
                ts TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record(&self, usage: &UsageRecord) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (run_id, step_id, model, input_tokens, output_tokens, cost_usd, ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(usage.run_id)
        .bind(usage.step_id)
        .bind(&usage.model)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cost_usd)
        .bind(usage.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Aggregate cost for one run — the minimal surface a billing/budget
    /// feature built on top of this core would query.
    pub async fn total_cost_for_run(&self, run_id: Uuid) -> CoreResult<f64> {
        let row: (Option<f64>,) = sqlx::query_as("SELECT SUM(cost_usd) FROM usage_records WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0.0))
    }
}
