//! OpenAI-compatible chat completions client. Most hosted LLM APIs speak
//! this wire format, so one implementation covers them all.

use super::{Decision, LanguageModel, ProposedToolCall};
use crate::state::RelevantContext;
use crate::tools::ToolSpec;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are a personal task assistant. Reply to the \
user in their language. When an action is needed, call the matching tool; \
the user will be asked to confirm it before anything runs. Keep replies short.";

pub struct OpenAiModel {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
}

impl OpenAiModel {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str, temperature: f64) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            model: model.to_string(),
            temperature,
        }
    }

    async fn chat(&self, body: Value) -> Result<Value> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.context("llm request")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("llm returned {status}: {body}");
        }
        response.json().await.context("llm response body")
    }
}

/// Map tool specs into the chat-completions `tools` array.
fn tools_to_wire(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

/// Pull text fragments and proposed tool calls out of a chat-completions
/// response. Tool-call arguments arrive as a JSON string; malformed argument
/// strings degrade to an empty object rather than failing the whole reply.
pub(crate) fn parse_decision(response: &Value) -> Decision {
    let message = &response["choices"][0]["message"];

    let mut decision = Decision::default();
    if let Some(content) = message["content"].as_str() {
        if !content.trim().is_empty() {
            decision.fragments.push(content.to_string());
        }
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let function = &call["function"];
            let Some(name) = function["name"].as_str() else {
                continue;
            };
            let arguments = function["arguments"]
                .as_str()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            decision.tool_calls.push(ProposedToolCall {
                name: name.to_string(),
                arguments,
            });
        }
    }
    decision
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn decide(
        &self,
        context: &RelevantContext,
        message: &str,
        tools: &[ToolSpec],
    ) -> Result<Decision> {
        let context_json = serde_json::to_string(context)?;
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "system", "content": format!("Conversation context:\n{context_json}")},
                {"role": "user", "content": message},
            ],
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools_to_wire(tools));
        }

        let response = self.chat(body).await?;
        Ok(parse_decision(&response))
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": 500,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self.chat(body).await?;
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .context("llm completion had no content")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decision_extracts_text_only() {
        let response = json!({
            "choices": [{"message": {"content": "All done.", "tool_calls": null}}]
        });
        let decision = parse_decision(&response);
        assert_eq!(decision.fragments, vec!["All done.".to_string()]);
        assert!(decision.tool_calls.is_empty());
    }

    #[test]
    fn parse_decision_extracts_tool_calls_with_string_arguments() {
        let response = json!({
            "choices": [{"message": {
                "content": "Creating that for you.",
                "tool_calls": [{
                    "id": "call_1",
                    "function": {
                        "name": "create_task",
                        "arguments": "{\"title\": \"buy milk\"}"
                    }
                }]
            }}]
        });
        let decision = parse_decision(&response);
        assert_eq!(decision.fragments.len(), 1);
        assert_eq!(decision.tool_calls.len(), 1);
        assert_eq!(decision.tool_calls[0].name, "create_task");
        assert_eq!(decision.tool_calls[0].arguments["title"], "buy milk");
    }

    #[test]
    fn parse_decision_tolerates_malformed_arguments() {
        let response = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "function": {"name": "create_task", "arguments": "{broken"}
                }]
            }}]
        });
        let decision = parse_decision(&response);
        assert!(decision.fragments.is_empty());
        assert_eq!(decision.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn parse_decision_handles_empty_response() {
        let decision = parse_decision(&json!({}));
        assert!(decision.fragments.is_empty());
        assert!(decision.tool_calls.is_empty());
    }

    #[test]
    fn tools_map_to_function_wire_format() {
        let specs = vec![ToolSpec {
            name: "create_task".into(),
            description: "Create a task".into(),
            parameters: json!({"type": "object"}),
        }];
        let wire = tools_to_wire(&specs);
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["function"]["name"], "create_task");
    }
}
