//! `llm-openai` / `llm-anthropic` — LLM completion blocks. Config: `model`,
//! `prompt` (already template-resolved by the executor before dispatch),
//! optional `api_base` to override the provider endpoint (tests point this
//! at a local mock server). Records usage via [`UsageRecord`] on success.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::usage::UsageRecord;

use super::{AdapterContext, AdapterOutcome, BlockAdapter};

pub struct LlmAdapter {
    kind: &'static str,
    default_base: &'static str,
    client: reqwest::Client,
}

impl LlmAdapter {
    pub fn openai() -> Self {
        Self {
            kind: "llm-openai",
            default_base: "https://api.openai.com/v1/chat/completions",
            client: reqwest::Client::new(),
        }
    }

    pub fn anthropic() -> Self {
        Self {
            kind: "llm-anthropic",
            default_base: "https://api.anthropic.com/v1/messages",
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlockAdapter for LlmAdapter {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn validate(&self, config: &Value) -> CoreResult<()> {
        if config.get("model").and_then(Value::as_str).is_none() {
            return Err(CoreError::Validation(format!("{} block requires a model", self.kind)));
        }
        if config.get("prompt").and_then(Value::as_str).is_none() {
            return Err(CoreError::Validation(format!("{} block requires a prompt", self.kind)));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &AdapterContext, config: &Value, _input: &Value) -> CoreResult<AdapterOutcome> {
        self.validate(config)?;
        let model = config.get("model").and_then(Value::as_str).unwrap().to_string();
        let prompt = config.get("prompt").and_then(Value::as_str).unwrap().to_string();
        let base = config.get("api_base").and_then(Value::as_str).unwrap_or(self.default_base);

        let adapter_err = |source: anyhow::Error| CoreError::Adapter {
            step_id: ctx.step_id,
            step_name: ctx.step_name.clone(),
            attempt: ctx.attempt,
            source,
        };

        let body = json!({ "model": model, "prompt": prompt });
        let response = self
            .client
            .post(base)
            .json(&body)
            .send()
            .await
            .map_err(|e| adapter_err(anyhow::anyhow!(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(adapter_err(anyhow::anyhow!("llm provider returned status {status}")));
        }

        let parsed: Value = response.json().await.unwrap_or_else(|_| json!({}));
        let text = parsed
            .get("output")
            .or_else(|| parsed.get("text"))
            .cloned()
            .unwrap_or(Value::Null);
        let input_tokens = parsed.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
        let output_tokens = parsed.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
        let cost_usd = parsed.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);

        let usage = UsageRecord::new(ctx.run_id, ctx.step_id, model, input_tokens, output_tokens, cost_usd);

        Ok(AdapterOutcome {
            output: json!({ "text": text }),
            chosen_ports: None,
            usage: Some(usage),
        })
    }
}
