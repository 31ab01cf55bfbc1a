//! Per-user conversational state: a versioned, strongly typed record with
//! bounded collections. Every mutation trims back to the caps immediately,
//! so the persisted state can never grow without limit.
//!
//! The decoder is forward compatible: unknown fields are ignored and missing
//! fields take their defaults, so older and newer daemons can share a store.

pub mod compression;
pub mod manager;

pub use manager::{OptimizeStats, RelevantContext, StateManager};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_MENTIONED_ENTITIES: usize = 10;
pub const MAX_CURRENT_TASKS: usize = 20;
pub const MAX_RECENT_ACTIONS: usize = 10;
pub const MAX_DIALOG_HISTORY: usize = 50;
pub const MAX_ARCHIVED_TOPICS: usize = 20;
pub const MAX_CONTEXT_TASKS: usize = 5;

/// Dialog grows past either of these and the semantic compressor kicks in.
pub const COMPRESSION_TRIGGER_MESSAGES: usize = 30;
pub const COMPRESSION_TRIGGER_TOKENS: usize = 2000;

/// Messages kept verbatim after a successful compression pass.
pub const KEEP_RECENT_MESSAGES: usize = 10;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Completed,
    Cancelled,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Closed tasks are dropped by structural optimization.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskEntry {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    /// Domain category of the task; matched against the active intent
    /// during relevance pruning.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub added_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for TaskEntry {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            title: String::new(),
            status: TaskStatus::Active,
            kind: None,
            added_at: Utc::now(),
            updated_at: None,
        }
    }
}

impl TaskEntry {
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.added_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Default for ActionEntry {
    fn default() -> Self {
        Self {
            kind: String::new(),
            description: String::new(),
            timestamp: Utc::now(),
            tool_name: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Default for DialogMessage {
    fn default() -> Self {
        Self {
            role: String::new(),
            content: String::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentContext {
    pub active_intent: Option<String>,
    pub mentioned_entities: Vec<String>,
    pub last_interaction: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMetadata {
    pub last_updated: Option<DateTime<Utc>>,
    pub total_interactions: u64,
    pub optimization_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_optimization: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_summary_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationState {
    pub version: u32,
    pub user_id: i64,
    pub current_context: CurrentContext,
    pub current_tasks: Vec<TaskEntry>,
    pub recent_actions: Vec<ActionEntry>,
    pub dialog_history: Vec<DialogMessage>,
    pub dialog_summary: Option<String>,
    pub long_term_context: Map<String, Value>,
    pub archived_topics: Vec<String>,
    pub metadata: StateMetadata,
}

fn keep_last<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

impl ConversationState {
    pub fn new(user_id: i64) -> Self {
        Self {
            version: STATE_VERSION,
            user_id,
            ..Self::default()
        }
    }

    /// Merge intent and mentioned entities into the current context and stamp
    /// the interaction time. Entities are deduplicated, last ten kept.
    pub fn update_current_context(&mut self, intent: Option<&str>, entities: &[String]) {
        if let Some(intent) = intent {
            self.current_context.active_intent = Some(intent.to_string());
        }
        for entity in entities {
            if !self.current_context.mentioned_entities.contains(entity) {
                self.current_context.mentioned_entities.push(entity.clone());
            }
        }
        keep_last(
            &mut self.current_context.mentioned_entities,
            MAX_MENTIONED_ENTITIES,
        );
        self.current_context.last_interaction = Some(Utc::now());
    }

    /// Add a task unless one with the same id is already tracked.
    pub fn add_task(&mut self, task: TaskEntry) {
        if self.current_tasks.iter().any(|t| t.task_id == task.task_id) {
            return;
        }
        self.current_tasks.push(task);
        keep_last(&mut self.current_tasks, MAX_CURRENT_TASKS);
    }

    /// Returns false when the task is not tracked.
    pub fn update_task_status(&mut self, task_id: &str, status: TaskStatus) -> bool {
        match self.current_tasks.iter_mut().find(|t| t.task_id == task_id) {
            Some(task) => {
                task.status = status;
                task.updated_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn remove_task(&mut self, task_id: &str) -> bool {
        let before = self.current_tasks.len();
        self.current_tasks.retain(|t| t.task_id != task_id);
        self.current_tasks.len() < before
    }

    pub fn add_action(&mut self, action: ActionEntry) {
        self.recent_actions.push(action);
        keep_last(&mut self.recent_actions, MAX_RECENT_ACTIONS);
    }

    pub fn add_dialog_message(&mut self, role: &str, content: &str) {
        self.dialog_history.push(DialogMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        });
        keep_last(&mut self.dialog_history, MAX_DIALOG_HISTORY);
    }

    pub fn add_archived_topic(&mut self, topic: &str) {
        if self.archived_topics.iter().any(|t| t == topic) {
            return;
        }
        self.archived_topics.push(topic.to_string());
        keep_last(&mut self.archived_topics, MAX_ARCHIVED_TOPICS);
    }

    pub fn update_long_term(&mut self, key: &str, value: Value) {
        self.long_term_context.insert(key.to_string(), value);
    }

    /// Rough token estimate for the dialog history: total characters / 4.
    pub fn estimated_dialog_tokens(&self) -> usize {
        let chars: usize = self
            .dialog_history
            .iter()
            .map(|m| m.content.chars().count())
            .sum();
        chars / 4
    }

    /// Clamp every timestamp to whole seconds so serialized state stays in
    /// one canonical format regardless of which writer produced it.
    pub fn normalize_timestamps(&mut self) {
        fn floor(ts: DateTime<Utc>) -> DateTime<Utc> {
            ts.with_nanosecond(0).unwrap_or(ts)
        }
        if let Some(ts) = self.current_context.last_interaction {
            self.current_context.last_interaction = Some(floor(ts));
        }
        for task in &mut self.current_tasks {
            task.added_at = floor(task.added_at);
            task.updated_at = task.updated_at.map(floor);
        }
        for action in &mut self.recent_actions {
            action.timestamp = floor(action.timestamp);
        }
        for message in &mut self.dialog_history {
            message.timestamp = floor(message.timestamp);
        }
        if let Some(ts) = self.metadata.last_updated {
            self.metadata.last_updated = Some(floor(ts));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(id: &str, title: &str) -> TaskEntry {
        TaskEntry {
            task_id: id.to_string(),
            title: title.to_string(),
            ..TaskEntry::default()
        }
    }

    #[test]
    fn bounded_collections_trim_on_mutation() {
        let mut state = ConversationState::new(1);
        for i in 0..(MAX_RECENT_ACTIONS + 5) {
            state.add_action(ActionEntry {
                kind: "noop".into(),
                description: format!("action {i}"),
                ..ActionEntry::default()
            });
        }
        assert_eq!(state.recent_actions.len(), MAX_RECENT_ACTIONS);
        // Most recent survive.
        assert!(state
            .recent_actions
            .last()
            .unwrap()
            .description
            .ends_with(&format!("{}", MAX_RECENT_ACTIONS + 4)));

        for i in 0..(MAX_DIALOG_HISTORY + 3) {
            state.add_dialog_message("user", &format!("msg {i}"));
        }
        assert_eq!(state.dialog_history.len(), MAX_DIALOG_HISTORY);

        for i in 0..(MAX_CURRENT_TASKS + 4) {
            state.add_task(task(&format!("t{i}"), "title"));
        }
        assert_eq!(state.current_tasks.len(), MAX_CURRENT_TASKS);
    }

    #[test]
    fn add_task_deduplicates_by_id() {
        let mut state = ConversationState::new(1);
        state.add_task(task("t1", "first"));
        state.add_task(task("t1", "duplicate"));
        assert_eq!(state.current_tasks.len(), 1);
        assert_eq!(state.current_tasks[0].title, "first");
    }

    #[test]
    fn mentioned_entities_dedup_and_cap() {
        let mut state = ConversationState::new(1);
        let first: Vec<String> = (0..8).map(|i| format!("e{i}")).collect();
        state.update_current_context(Some("create_task"), &first);
        state.update_current_context(None, &first);
        assert_eq!(state.current_context.mentioned_entities.len(), 8);

        let more: Vec<String> = (8..15).map(|i| format!("e{i}")).collect();
        state.update_current_context(None, &more);
        assert_eq!(
            state.current_context.mentioned_entities.len(),
            MAX_MENTIONED_ENTITIES
        );
        // Oldest were evicted.
        assert!(!state
            .current_context
            .mentioned_entities
            .contains(&"e0".to_string()));
        assert_eq!(
            state.current_context.active_intent.as_deref(),
            Some("create_task")
        );
    }

    #[test]
    fn serde_roundtrip_is_field_equal() {
        let mut state = ConversationState::new(99);
        state.add_task(task("t1", "buy milk"));
        state.add_action(ActionEntry {
            kind: "tool_call_success".into(),
            description: "created task".into(),
            tool_name: Some("create_task".into()),
            ..ActionEntry::default()
        });
        state.add_dialog_message("user", "hello");
        state.dialog_summary = Some("summary".into());
        state.add_archived_topic("groceries");
        state.update_long_term("preferences", serde_json::json!({"lang": "en"}));
        state.normalize_timestamps();

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ConversationState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn decoder_tolerates_unknown_and_missing_fields() {
        let raw = r#"{
            "user_id": 5,
            "dialog_summary": "old summary",
            "brand_new_field": {"nested": true},
            "current_tasks": [
                {"task_id": "t9", "title": "x", "status": "paused", "extra": 1,
                 "added_at": "2026-08-29T10:00:00Z"}
            ]
        }"#;
        let state: ConversationState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.user_id, 5);
        assert_eq!(state.dialog_summary.as_deref(), Some("old summary"));
        assert!(state.dialog_history.is_empty());
        assert_eq!(state.current_tasks[0].status, TaskStatus::Unknown);
    }

    #[test]
    fn normalize_timestamps_drops_subseconds() {
        let mut state = ConversationState::new(1);
        let precise = Utc::now()
            .with_nanosecond(123_456_789)
            .unwrap();
        state.add_task(TaskEntry {
            task_id: "t".into(),
            added_at: precise,
            updated_at: Some(precise + Duration::seconds(1)),
            ..TaskEntry::default()
        });
        state.normalize_timestamps();
        assert_eq!(state.current_tasks[0].added_at.nanosecond(), 0);
        assert_eq!(state.current_tasks[0].updated_at.unwrap().nanosecond(), 0);
    }

    #[test]
    fn token_estimate_counts_chars_over_four() {
        let mut state = ConversationState::new(1);
        state.add_dialog_message("user", &"x".repeat(400));
        state.add_dialog_message("assistant", &"y".repeat(401));
        assert_eq!(state.estimated_dialog_tokens(), 200);
    }

    #[test]
    fn closed_statuses_classified() {
        assert!(TaskStatus::Completed.is_closed());
        assert!(TaskStatus::Cancelled.is_closed());
        assert!(TaskStatus::Deleted.is_closed());
        assert!(!TaskStatus::Active.is_closed());
        assert!(!TaskStatus::Unknown.is_closed());
    }
}
