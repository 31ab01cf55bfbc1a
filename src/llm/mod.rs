//! LLM decision seam. The model sees a pruned context, the incoming text,
//! and the tool catalog; it answers with text fragments and/or proposed tool
//! invocations. Proposed calls are never executed directly; they go through
//! the confirmation protocol first.

pub mod openai;

pub use openai::OpenAiModel;

use crate::state::RelevantContext;
use crate::tools::ToolSpec;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A tool invocation the model wants to make, pending user approval.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Plain-text parts of the reply, in order.
    pub fragments: Vec<String>,
    pub tool_calls: Vec<ProposedToolCall>,
    /// Detected user intent, fed into the conversation context.
    pub intent: Option<String>,
    /// Entity strings the model surfaced, fed into the conversation context.
    pub entities: Vec<String>,
}

impl Decision {
    /// Fill `intent` and `entities` from the proposed calls when the provider
    /// did not report them directly: the first call's name is the intent, and
    /// string-valued arguments are the mentioned entities.
    pub fn derive_context(&mut self) {
        if self.intent.is_none() {
            self.intent = self.tool_calls.first().map(|c| c.name.clone());
        }
        for call in &self.tool_calls {
            let Some(args) = call.arguments.as_object() else {
                continue;
            };
            for value in args.values() {
                if let Some(s) = value.as_str() {
                    if !s.is_empty() && !self.entities.iter().any(|e| e == s) {
                        self.entities.push(s.to_string());
                    }
                }
            }
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One decision round for a user message.
    async fn decide(
        &self,
        context: &RelevantContext,
        message: &str,
        tools: &[ToolSpec],
    ) -> Result<Decision>;

    /// Raw single-prompt completion; used by the semantic compressor.
    async fn complete(&self, prompt: &str) -> Result<String>;
}
