//! Load/sync and optimization driver for one user's conversation state.
//!
//! Single-writer by convention: only the session that holds the user's lock
//! mutates state, so there is no optimistic concurrency control here.

use super::compression;
use super::{
    ConversationState, TaskEntry, COMPRESSION_TRIGGER_MESSAGES, COMPRESSION_TRIGGER_TOKENS,
    MAX_CONTEXT_TASKS, MAX_CURRENT_TASKS, MAX_RECENT_ACTIONS,
};
use crate::llm::LanguageModel;
use crate::state::ActionEntry;
use crate::store::{keys, KvStore};
use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Persisted state lives for 24 hours past the last write.
pub const STATE_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Tasks touched within this window score as "recent" during pruning.
const RECENT_TASK_WINDOW: Duration = Duration::hours(1);

/// What one optimization pass did; logged per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub tasks_removed: usize,
    pub actions_trimmed: usize,
    pub dialog_compressed: usize,
    pub semantic_ran: bool,
}

/// The bounded slice of state handed to the language model. Regardless of how
/// large the stored state is, this is all the model ever sees.
#[derive(Debug, Clone, Serialize)]
pub struct RelevantContext {
    pub current_context: super::CurrentContext,
    pub relevant_tasks: Vec<TaskEntry>,
    pub recent_actions: Vec<ActionEntry>,
    pub dialog_summary: Option<String>,
    pub long_term_context: Map<String, Value>,
}

pub struct StateManager {
    user_id: i64,
    kv: Arc<dyn KvStore>,
    state: ConversationState,
}

impl StateManager {
    pub fn new(user_id: i64, kv: Arc<dyn KvStore>) -> Self {
        Self {
            user_id,
            kv,
            state: ConversationState::new(user_id),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConversationState {
        &mut self.state
    }

    /// Load persisted state, falling back to a fresh default when the key is
    /// absent or the stored JSON does not decode (old writers, corruption).
    pub async fn load_from_redis(&mut self) -> Result<bool> {
        let key = keys::state(self.user_id);
        match self.kv.get(&key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(state) => {
                    self.state = state;
                    Ok(true)
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = self.user_id,
                        "stored state did not decode, starting fresh: {e}"
                    );
                    self.state = ConversationState::new(self.user_id);
                    Ok(false)
                }
            },
            None => Ok(false),
        }
    }

    /// Serialize the whole state and refresh its TTL.
    pub async fn sync_to_redis(&mut self) -> Result<()> {
        self.state.metadata.last_updated = Some(Utc::now());
        let raw = serde_json::to_string(&self.state)?;
        self.kv
            .set_ex(&keys::state(self.user_id), &raw, STATE_TTL)
            .await
    }

    /// Full optimization pass: structural always, semantic when the dialog
    /// has outgrown its thresholds. Semantic failures are logged and leave
    /// the state untouched.
    pub async fn optimize(&mut self, llm: &dyn LanguageModel) -> OptimizeStats {
        let mut stats = self.structural_optimization();

        if self.needs_semantic_compression() {
            match compression::compress(&mut self.state, llm).await {
                Ok(Some(compressed)) => {
                    stats.dialog_compressed = compressed;
                    stats.semantic_ran = true;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        user_id = self.user_id,
                        "semantic compression failed (state unchanged): {e}"
                    );
                }
            }
        }

        self.state.metadata.optimization_count += 1;
        self.state.metadata.last_optimization = Some(Utc::now());
        stats
    }

    /// Drop closed tasks, enforce the caps, normalize timestamps. Cheap and
    /// unconditional: runs before every use of the state.
    pub fn structural_optimization(&mut self) -> OptimizeStats {
        let mut stats = OptimizeStats::default();

        let before = self.state.current_tasks.len();
        self.state.current_tasks.retain(|t| !t.status.is_closed());
        stats.tasks_removed = before - self.state.current_tasks.len();

        if self.state.current_tasks.len() > MAX_CURRENT_TASKS {
            self.state
                .current_tasks
                .sort_by(|a, b| b.last_touched().cmp(&a.last_touched()));
            stats.tasks_removed += self.state.current_tasks.len() - MAX_CURRENT_TASKS;
            self.state.current_tasks.truncate(MAX_CURRENT_TASKS);
        }

        if self.state.recent_actions.len() > MAX_RECENT_ACTIONS {
            let excess = self.state.recent_actions.len() - MAX_RECENT_ACTIONS;
            self.state.recent_actions.drain(..excess);
            stats.actions_trimmed = excess;
        }

        self.state.normalize_timestamps();
        stats
    }

    pub fn needs_semantic_compression(&self) -> bool {
        self.state.dialog_history.len() > COMPRESSION_TRIGGER_MESSAGES
            || self.state.estimated_dialog_tokens() > COMPRESSION_TRIGGER_TOKENS
    }

    /// Relevance pruning: score every task against the utterance and keep the
    /// top few, plus the freshest actions, the summary, and long-term notes.
    ///
    /// Scoring: +3 when the utterance shares a word with the task id/title,
    /// +2 when the task was touched within the last hour, +1 when its type
    /// matches the detected intent. Stable sort keeps insertion order on ties.
    pub fn relevant_context(&self, utterance: &str, intent: Option<&str>) -> RelevantContext {
        let keywords: Vec<String> = utterance
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let now = Utc::now();

        let mut scored: Vec<(u32, &TaskEntry)> = Vec::new();
        for task in &self.state.current_tasks {
            let mut score = 0u32;
            let task_text = format!("{} {}", task.task_id, task.title).to_lowercase();
            if keywords.iter().any(|kw| task_text.contains(kw.as_str())) {
                score += 3;
            }
            if now - task.last_touched() < RECENT_TASK_WINDOW {
                score += 2;
            }
            if let (Some(intent), Some(kind)) = (intent, task.kind.as_deref()) {
                if intent == kind {
                    score += 1;
                }
            }
            if score > 0 {
                scored.push((score, task));
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(MAX_CONTEXT_TASKS);

        let action_tail = self.state.recent_actions.len().saturating_sub(5);
        RelevantContext {
            current_context: self.state.current_context.clone(),
            relevant_tasks: scored.into_iter().map(|(_, t)| t.clone()).collect(),
            recent_actions: self.state.recent_actions[action_tail..].to_vec(),
            dialog_summary: self.state.dialog_summary.clone(),
            long_term_context: self.state.long_term_context.clone(),
        }
    }
}
