//! `http` — outbound HTTP request block. Config: `url`, `method` (default
//! `GET`), `body` (JSON, optional), `headers` (object, optional). Emits the
//! parsed JSON response body (or `{"text": ...}` if the body isn't JSON) as
//! output. Grounded on `other_examples/..._n8n-rs__..._executor.rs`'s
//! `httpRequest` handling.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};

use super::{AdapterContext, AdapterOutcome, BlockAdapter};

pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlockAdapter for HttpAdapter {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn validate(&self, config: &Value) -> CoreResult<()> {
        let url = config.get("url").and_then(Value::as_str);
        match url {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => Ok(()),
            _ => Err(CoreError::Validation("http block requires a valid http(s) url".into())),
        }
    }

    async fn execute(&self, ctx: &AdapterContext, config: &Value, _input: &Value) -> CoreResult<AdapterOutcome> {
        self.validate(config)?;
        let url = config.get("url").and_then(Value::as_str).unwrap();
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let mut req = match method.as_str() {
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => self.client.get(url),
        };

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    req = req.header(key.as_str(), v);
                }
            }
        }
        if let Some(body) = config.get("body") {
            req = req.json(body);
        }

        let adapter_err = |source: anyhow::Error| CoreError::Adapter {
            step_id: ctx.step_id,
            step_name: ctx.step_name.clone(),
            attempt: ctx.attempt,
            source,
        };

        let response = req
            .send()
            .await
            .map_err(|e| adapter_err(anyhow::anyhow!(e)))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(adapter_err(anyhow::anyhow!("http request failed with status {status}: {text}")));
        }

        let output = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| json!({ "text": text }));
        Ok(AdapterOutcome::simple(output))
    }
}
