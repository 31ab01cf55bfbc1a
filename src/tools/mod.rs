//! Tool provider seam: an external registry and executor of named,
//! side-effecting operations. The session only talks to it through this
//! trait; every call has been user-confirmed by the time it lands here.

pub mod http;

pub use http::HttpToolProvider;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provider-agnostic tool description handed to the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

/// Outcome of a tool execution. `success == false` with `Ok(..)` means the
/// tool itself reported a domain failure; transport errors surface as `Err`.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub payload: Value,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Value::Null,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<ToolOutcome>;
}
