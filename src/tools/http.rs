//! JSON-RPC client for the external tool server (MCP-style HTTP endpoint).

use super::{ToolOutcome, ToolProvider, ToolSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct HttpToolProvider {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpToolProvider {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("tool server {method} request"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("tool server returned {status} for {method}");
        }
        let reply: Value = response
            .json()
            .await
            .with_context(|| format!("tool server {method} response"))?;
        if let Some(error) = reply.get("error") {
            if !error.is_null() {
                anyhow::bail!("tool server {method} error: {error}");
            }
        }
        Ok(reply["result"].clone())
    }
}

/// Tool results come back as a content list whose first text block usually
/// holds a JSON document with a `success` flag. Anything else is wrapped
/// verbatim so the caller still gets a payload.
pub(crate) fn parse_call_result(result: &Value) -> ToolOutcome {
    let text = result["content"][0]["text"].as_str();
    let payload = match text {
        Some(text) => serde_json::from_str(text)
            .unwrap_or_else(|_| json!({"result": text})),
        None => result.clone(),
    };

    let success = payload
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let error = payload
        .get("error")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    ToolOutcome {
        success,
        payload,
        error,
    }
}

#[async_trait]
impl ToolProvider for HttpToolProvider {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .context("tool list missing `tools` array")?;
        Ok(tools
            .iter()
            .filter_map(|t| {
                Some(ToolSpec {
                    name: t["name"].as_str()?.to_string(),
                    description: t["description"].as_str().unwrap_or_default().to_string(),
                    parameters: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<ToolOutcome> {
        let result = self
            .rpc(
                "tools/call",
                json!({"name": name, "arguments": arguments}),
            )
            .await?;
        Ok(parse_call_result(&result))
    }
}
