//! Per-user agent session: consumes the user's event stream in order, drives
//! LLM decisions, and mediates side-effecting tool calls through the
//! confirmation protocol.
//!
//! Lifecycle: Starting (load state, fetch tool catalog) → Listening (bounded
//! stream read, raced against cancellation) → Processing (every delivered
//! entry) → Listening. Entry-level failures are logged and skipped; stream
//! and startup failures kill the session and the scheduler reclaims it on
//! its next sweep.

use crate::confirm::{
    parse_callback, ConfirmDecision, ConfirmationStore, PendingConfirmation, CONFIRM_NO_PREFIX,
    CONFIRM_YES_PREFIX,
};
use crate::error::{EntryError, SessionError};
use crate::gateway::{ConfirmButtons, Gateway};
use crate::llm::LanguageModel;
use crate::state::{ActionEntry, StateManager, TaskEntry, TaskStatus};
use crate::store::{EventStream, KvStore, StreamEntry, CURSOR_LATEST};
use crate::tools::{ToolProvider, ToolSpec};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long one stream read may block; the cancellation token is re-checked
/// at this cadence.
pub const STREAM_READ_BLOCK: Duration = Duration::from_secs(1);

/// Everything a session needs from the outside world. All seams, all shared.
#[derive(Clone)]
pub struct SessionContext {
    pub kv: Arc<dyn KvStore>,
    pub stream: Arc<dyn EventStream>,
    pub gateway: Arc<dyn Gateway>,
    pub llm: Arc<dyn LanguageModel>,
    pub tools: Arc<dyn ToolProvider>,
    pub confirmations: Arc<dyn ConfirmationStore>,
}

/// One entry's payload, dispatched on shape.
#[derive(Debug, Clone, PartialEq)]
enum InboundEvent {
    Text(String),
    Callback { callback_id: String, data: String },
}

/// Parse a stream entry payload. A `callback_query` object is a confirmation
/// response; an object with `text` is a plain message; anything that is not
/// JSON at all is treated as raw text (legacy producers).
fn parse_payload(raw: &str) -> Result<InboundEvent, EntryError> {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Ok(InboundEvent::Text(raw.to_string()));
    };
    if let Some(callback) = value.get("callback_query") {
        return Ok(InboundEvent::Callback {
            callback_id: callback["id"].as_str().unwrap_or_default().to_string(),
            data: callback["data"].as_str().unwrap_or_default().to_string(),
        });
    }
    if let Some(text) = value.get("text").and_then(Value::as_str) {
        return Ok(InboundEvent::Text(text.to_string()));
    }
    Err(EntryError::MalformedPayload(format!(
        "payload has neither text nor callback_query: {raw}"
    )))
}

pub struct AgentSession {
    user_id: i64,
    /// Short random id so interleaved session logs stay attributable.
    session_id: String,
    ctx: SessionContext,
    cancel: CancellationToken,
    /// Shared with the scheduler, which evicts on idle time.
    last_active: Arc<Mutex<Instant>>,
    read_block: Duration,
}

impl AgentSession {
    pub fn new(
        user_id: i64,
        ctx: SessionContext,
        cancel: CancellationToken,
        last_active: Arc<Mutex<Instant>>,
    ) -> Self {
        *last_active.lock() = Instant::now();
        Self {
            user_id,
            session_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            ctx,
            cancel,
            last_active,
            read_block: STREAM_READ_BLOCK,
        }
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Run until cancelled or a fatal error. State is synced best-effort on
    /// the way out.
    pub async fn run(self) -> Result<(), SessionError> {
        let mut state = StateManager::new(self.user_id, Arc::clone(&self.ctx.kv));
        state
            .load_from_redis()
            .await
            .map_err(SessionError::Transport)?;

        let catalog = self
            .ctx
            .tools
            .list_tools()
            .await
            .map_err(SessionError::ToolProviderStartup)?;

        tracing::info!(
            user_id = self.user_id,
            session = %self.session_id,
            tools = catalog.len(),
            "agent session started"
        );

        let mut cursor = CURSOR_LATEST.to_string();
        let result = self.message_loop(&mut state, &catalog, &mut cursor).await;

        if let Err(e) = state.sync_to_redis().await {
            tracing::warn!(
                user_id = self.user_id,
                session = %self.session_id,
                "state sync on shutdown failed: {e}"
            );
        }
        tracing::info!(
            user_id = self.user_id,
            session = %self.session_id,
            "agent session stopped"
        );
        result
    }

    async fn message_loop(
        &self,
        state: &mut StateManager,
        catalog: &[ToolSpec],
        cursor: &mut String,
    ) -> Result<(), SessionError> {
        loop {
            let entries = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = self.ctx.stream.read(self.user_id, cursor, self.read_block) => {
                    read.map_err(SessionError::Transport)?
                }
            };

            for entry in entries {
                self.touch();
                *cursor = entry.id.clone();
                if let Err(e) = self.process_entry(state, catalog, &entry).await {
                    tracing::error!(
                        user_id = self.user_id,
                        session = %self.session_id,
                        entry = %entry.id,
                        "entry processing failed: {e}"
                    );
                }
                // Cooperative cancellation: finish the current entry, then go.
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
            }
        }
    }

    async fn process_entry(
        &self,
        state: &mut StateManager,
        catalog: &[ToolSpec],
        entry: &StreamEntry,
    ) -> Result<(), EntryError> {
        match parse_payload(&entry.payload)? {
            InboundEvent::Callback { callback_id, data } => {
                self.handle_callback(state, &callback_id, &data).await
            }
            InboundEvent::Text(text) => self.handle_text(state, catalog, &text).await,
        }
    }

    async fn send(&self, text: &str) -> Result<(), EntryError> {
        self.ctx
            .gateway
            .send_text(self.user_id, text)
            .await
            .map_err(EntryError::Gateway)
    }

    async fn handle_callback(
        &self,
        state: &mut StateManager,
        callback_id: &str,
        data: &str,
    ) -> Result<(), EntryError> {
        if !callback_id.is_empty() {
            if let Err(e) = self.ctx.gateway.answer_callback(callback_id).await {
                tracing::warn!(user_id = self.user_id, "callback ack failed: {e}");
            }
        }

        let Some((decision, key)) = parse_callback(data) else {
            tracing::debug!(user_id = self.user_id, "ignoring unrelated callback: {data}");
            return Ok(());
        };

        let record = self
            .ctx
            .confirmations
            .take(key)
            .await
            .map_err(EntryError::Store)?;
        let Some(record) = record else {
            self.send("⚠️ Confirmation expired or not found.").await?;
            return Ok(());
        };

        match decision {
            ConfirmDecision::Approve => self.execute_confirmed(state, record).await,
            ConfirmDecision::Reject => {
                state.state_mut().add_action(ActionEntry {
                    kind: "tool_call_rejected".into(),
                    description: format!("Rejected {}", record.function_name),
                    tool_name: Some(record.function_name.clone()),
                    ..ActionEntry::default()
                });
                self.sync_state(state).await;
                self.send(&format!("❌ {} cancelled.", record.function_name))
                    .await
            }
        }
    }

    async fn execute_confirmed(
        &self,
        state: &mut StateManager,
        record: PendingConfirmation,
    ) -> Result<(), EntryError> {
        let name = record.function_name.clone();
        // Progress notice only; a delivery hiccup must not block the already
        // approved execution.
        if let Err(e) = self.send(&format!("⚡ Executing {name}…")).await {
            tracing::warn!(user_id = self.user_id, "executing notice failed: {e}");
        }

        let report = match self.ctx.tools.call_tool(&name, &record.arguments).await {
            Ok(outcome) if outcome.success => {
                self.apply_tool_result(state, &record, &outcome.payload);
                state.state_mut().add_action(ActionEntry {
                    kind: "tool_call_success".into(),
                    description: format!("Executed {name}"),
                    tool_name: Some(name.clone()),
                    detail: Some(outcome.payload.clone()),
                    ..ActionEntry::default()
                });
                match outcome.payload.get("title").and_then(Value::as_str) {
                    Some(title) => format!("✅ {name} executed: {title}"),
                    None => format!("✅ {name} executed"),
                }
            }
            Ok(outcome) => {
                let reason = outcome.error.unwrap_or_else(|| "unknown error".into());
                state.state_mut().add_action(ActionEntry {
                    kind: "tool_call_failed".into(),
                    description: format!("Failed {name}: {reason}"),
                    tool_name: Some(name.clone()),
                    ..ActionEntry::default()
                });
                format!("❌ failed: {name}: {reason}")
            }
            Err(e) => {
                state.state_mut().add_action(ActionEntry {
                    kind: "tool_call_failed".into(),
                    description: format!("Failed {name}: {e}"),
                    tool_name: Some(name.clone()),
                    ..ActionEntry::default()
                });
                format!("❌ failed: {name}: {e}")
            }
        };

        let stats = state.optimize(self.ctx.llm.as_ref()).await;
        tracing::debug!(user_id = self.user_id, ?stats, "state optimized after tool execution");
        self.sync_state(state).await;
        self.send(&report).await
    }

    /// Task bookkeeping for the domain tools that change the task list.
    fn apply_tool_result(
        &self,
        state: &mut StateManager,
        record: &PendingConfirmation,
        payload: &Value,
    ) {
        match record.function_name.as_str() {
            "create_task" => {
                if let Some(task_id) = payload.get("task_id").and_then(Value::as_str) {
                    let title = payload
                        .get("title")
                        .or_else(|| record.arguments.get("title"))
                        .and_then(Value::as_str)
                        .unwrap_or("untitled")
                        .to_string();
                    let kind = payload
                        .get("type")
                        .or_else(|| record.arguments.get("type"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    state.state_mut().add_task(TaskEntry {
                        task_id: task_id.to_string(),
                        title,
                        kind,
                        ..TaskEntry::default()
                    });
                }
            }
            "update_task_status" => {
                let task_id = record.arguments.get("task_id").and_then(Value::as_str);
                let status = record
                    .arguments
                    .get("status")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<TaskStatus>(v).ok())
                    .unwrap_or(TaskStatus::Unknown);
                if let Some(task_id) = task_id {
                    state.state_mut().update_task_status(task_id, status);
                }
            }
            _ => {}
        }
    }

    async fn handle_text(
        &self,
        state: &mut StateManager,
        catalog: &[ToolSpec],
        text: &str,
    ) -> Result<(), EntryError> {
        state.structural_optimization();
        let intent = state.state().current_context.active_intent.clone();
        let context = state.relevant_context(text, intent.as_deref());

        let mut decision = self
            .ctx
            .llm
            .decide(&context, text, catalog)
            .await
            .map_err(EntryError::Llm)?;
        decision.derive_context();

        let mut buffer = String::new();
        for fragment in &decision.fragments {
            if !buffer.is_empty() {
                buffer.push_str("\n\n");
            }
            buffer.push_str(fragment);
        }

        for call in &decision.tool_calls {
            let key = self
                .ctx
                .confirmations
                .stage(self.user_id, &call.name, call.arguments.clone())
                .await
                .map_err(EntryError::Store)?;

            let prompt = confirmation_prompt(&call.name, &call.arguments);
            let buttons = ConfirmButtons::yes_no(
                format!("{CONFIRM_YES_PREFIX}{key}"),
                format!("{CONFIRM_NO_PREFIX}{key}"),
            );
            if let Err(e) = self
                .ctx
                .gateway
                .send_confirmation(self.user_id, &prompt, &buttons)
                .await
            {
                // Prompt never reached the user: unstage so the token cannot
                // linger as an unanswerable confirmation.
                let _ = self.ctx.confirmations.discard(&key).await;
                return Err(EntryError::Gateway(e));
            }

            state.state_mut().add_action(ActionEntry {
                kind: "tool_call_staged".into(),
                description: format!("Staged {}", call.name),
                tool_name: Some(call.name.clone()),
                detail: Some(call.arguments.clone()),
                ..ActionEntry::default()
            });
            if !buffer.is_empty() {
                buffer.push_str("\n\n");
            }
            buffer.push_str(&format!("⏳ awaiting confirmation: {}", call.name));
        }

        if !buffer.is_empty() {
            self.send(&buffer).await?;
        }

        state.state_mut().add_dialog_message("user", text);
        if !buffer.is_empty() {
            state.state_mut().add_dialog_message("assistant", &buffer);
        }
        state.state_mut().metadata.total_interactions += 1;
        state
            .state_mut()
            .update_current_context(decision.intent.as_deref(), &decision.entities);

        let stats = state.optimize(self.ctx.llm.as_ref()).await;
        tracing::debug!(user_id = self.user_id, ?stats, "state optimized");
        self.sync_state(state).await;
        Ok(())
    }

    /// State persistence is best-effort inside entry processing; a failed
    /// sync must not lose the reply that was already sent.
    async fn sync_state(&self, state: &mut StateManager) {
        if let Err(e) = state.sync_to_redis().await {
            tracing::warn!(
                user_id = self.user_id,
                session = %self.session_id,
                "state sync failed: {e}"
            );
        }
    }
}

fn confirmation_prompt(name: &str, arguments: &Value) -> String {
    let args = serde_json::to_string_pretty(arguments).unwrap_or_else(|_| "{}".into());
    format!("🔔 Confirm action: {name}\n{args}\n\nRun it?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_with_text_is_plain_message() {
        let event = parse_payload(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(event, InboundEvent::Text("hello".into()));
    }

    #[test]
    fn payload_with_callback_query_is_callback() {
        let event = parse_payload(
            r#"{"callback_query": {"id": "cb9", "data": "confirm_yes:mcp_confirm:1:ab"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::Callback {
                callback_id: "cb9".into(),
                data: "confirm_yes:mcp_confirm:1:ab".into(),
            }
        );
    }

    #[test]
    fn non_json_payload_degrades_to_text() {
        let event = parse_payload("just words").unwrap();
        assert_eq!(event, InboundEvent::Text("just words".into()));
    }

    #[test]
    fn json_without_known_shape_is_malformed() {
        let err = parse_payload(r#"{"photo": "cat.jpg"}"#).unwrap_err();
        assert!(matches!(err, EntryError::MalformedPayload(_)));
    }

    #[test]
    fn confirmation_prompt_names_tool_and_arguments() {
        let prompt =
            confirmation_prompt("create_task", &serde_json::json!({"title": "buy milk"}));
        assert!(prompt.contains("create_task"));
        assert!(prompt.contains("buy milk"));
    }
}
