//! Outbound messaging seam. The session sends plain replies, confirmation
//! prompts with approve/reject buttons, and callback acknowledgements through
//! this trait; production wires it to the Telegram Bot API.

pub mod telegram;

pub use telegram::TelegramGateway;

use anyhow::Result;
use async_trait::async_trait;

/// Inline approve/reject pair attached to a confirmation prompt. The `data`
/// fields are the opaque callback payloads echoed back by the platform.
#[derive(Debug, Clone)]
pub struct ConfirmButtons {
    pub approve_label: String,
    pub approve_data: String,
    pub reject_label: String,
    pub reject_data: String,
}

impl ConfirmButtons {
    pub fn yes_no(approve_data: impl Into<String>, reject_data: impl Into<String>) -> Self {
        Self {
            approve_label: "✅ Yes".to_string(),
            approve_data: approve_data.into(),
            reject_label: "❌ No".to_string(),
            reject_data: reject_data.into(),
        }
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_text(&self, user_id: i64, text: &str) -> Result<()>;

    async fn send_confirmation(
        &self,
        user_id: i64,
        text: &str,
        buttons: &ConfirmButtons,
    ) -> Result<()>;

    /// Acknowledge a callback so the client stops showing a spinner.
    async fn answer_callback(&self, callback_id: &str) -> Result<()>;
}
