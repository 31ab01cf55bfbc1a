//! Telegram Bot API client for the outbound gateway.

use super::{ConfirmButtons, Gateway};
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects message text beyond 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramGateway {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl TelegramGateway {
    pub fn new(bot_token: &str, api_base: Option<&str>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base: api_base
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    async fn call(&self, method: &str, body: Value) -> Result<()> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("telegram {method} request"))?;

        let status = response.status();
        let api: ApiResponse = response
            .json()
            .await
            .with_context(|| format!("telegram {method} response body"))?;
        if !api.ok {
            anyhow::bail!(
                "telegram {method} failed ({status}): {}",
                api.description.unwrap_or_else(|| "no description".into())
            );
        }
        Ok(())
    }
}

pub(crate) fn confirm_keyboard(buttons: &ConfirmButtons) -> Value {
    json!({
        "inline_keyboard": [[
            {"text": buttons.approve_label, "callback_data": buttons.approve_data},
            {"text": buttons.reject_label, "callback_data": buttons.reject_data},
        ]]
    })
}

#[async_trait]
impl Gateway for TelegramGateway {
    async fn send_text(&self, user_id: i64, text: &str) -> Result<()> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": user_id,
                "text": truncate_with_ellipsis(text, MAX_MESSAGE_CHARS),
            }),
        )
        .await
    }

    async fn send_confirmation(
        &self,
        user_id: i64,
        text: &str,
        buttons: &ConfirmButtons,
    ) -> Result<()> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": user_id,
                "text": truncate_with_ellipsis(text, MAX_MESSAGE_CHARS),
                "reply_markup": confirm_keyboard(buttons),
            }),
        )
        .await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        self.call(
            "answerCallbackQuery",
            json!({"callback_query_id": callback_id}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_urls_embed_token() {
        let gateway = TelegramGateway::new("123:abc", None);
        assert_eq!(
            gateway.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );

        let custom = TelegramGateway::new("t", Some("http://localhost:8081/"));
        assert_eq!(
            custom.method_url("answerCallbackQuery"),
            "http://localhost:8081/bott/answerCallbackQuery"
        );
    }

    #[test]
    fn keyboard_carries_callback_payloads() {
        let buttons = ConfirmButtons::yes_no("confirm_yes:k1", "confirm_no:k1");
        let keyboard = confirm_keyboard(&buttons);
        let row = &keyboard["inline_keyboard"][0];
        assert_eq!(row[0]["callback_data"], "confirm_yes:k1");
        assert_eq!(row[1]["callback_data"], "confirm_no:k1");
        assert_eq!(row[0]["text"], "✅ Yes");
    }
}
