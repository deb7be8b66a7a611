//! `mock` — a deterministic-ish test/demo block. Emits `config.out` (or the
//! whole config if `out` is absent) as its output, after a short randomized
//! delay. Setting `config.fail = true` forces an adapter error, mirroring
//! the teacher's `engine::simulate_step_execution` "fail_test" escape hatch.

use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::error::{CoreError, CoreResult};

use super::{AdapterContext, AdapterOutcome, BlockAdapter};

pub struct MockAdapter;

#[async_trait]
impl BlockAdapter for MockAdapter {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, ctx: &AdapterContext, config: &Value, input: &Value) -> CoreResult<AdapterOutcome> {
        let delay_ms = thread_rng().gen_range(1..5);
        sleep(Duration::from_millis(delay_ms)).await;

        if config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(CoreError::Adapter {
                step_id: ctx.step_id,
                step_name: ctx.step_name.clone(),
                attempt: ctx.attempt,
                source: anyhow::anyhow!("mock adapter configured to fail"),
            });
        }

        let output = config.get("out").cloned().unwrap_or_else(|| json!({ "echo": input }));
        Ok(AdapterOutcome::simple(output))
    }
}
