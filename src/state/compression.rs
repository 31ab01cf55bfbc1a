//! Semantic compression: one LLM call that folds a long dialog history into
//! a short summary, a topic list, and optional user preferences. Any failure
//! (transport or unparsable output) leaves the state exactly as it was.

use super::{ConversationState, KEEP_RECENT_MESSAGES};
use crate::llm::LanguageModel;
use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use std::fmt::Write;

/// Transcript fed to the model is capped; older lines are dropped first.
const MAX_SOURCE_CHARS: usize = 32_000;

#[derive(Debug, Deserialize)]
struct CompressionOutput {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    user_preferences: Option<serde_json::Value>,
}

/// Run one compression pass. Returns `Ok(Some(n))` with the number of dialog
/// messages folded away, `Ok(None)` when there was nothing to do or the model
/// output did not parse (state unchanged), `Err` on transport failure.
pub async fn compress(
    state: &mut ConversationState,
    llm: &dyn LanguageModel,
) -> Result<Option<usize>> {
    if state.dialog_history.is_empty() {
        return Ok(None);
    }

    let transcript = build_transcript(state);
    let prompt = build_prompt(&transcript);
    let raw = llm.complete(&prompt).await?;

    let Some(output) = parse_output(&raw) else {
        tracing::warn!(
            user_id = state.user_id,
            "compression output did not parse as JSON, keeping state"
        );
        return Ok(None);
    };

    state.dialog_summary = Some(output.summary);
    state.metadata.last_summary_update = Some(Utc::now());
    for topic in &output.topics {
        state.add_archived_topic(topic);
    }
    if let Some(preferences) = output.user_preferences {
        state.update_long_term("preferences", preferences);
    }

    let before = state.dialog_history.len();
    let tail = before.saturating_sub(KEEP_RECENT_MESSAGES);
    state.dialog_history.drain(..tail);

    Ok(Some(before - state.dialog_history.len()))
}

fn build_transcript(state: &ConversationState) -> String {
    let mut transcript = String::new();
    for message in &state.dialog_history {
        let _ = writeln!(transcript, "{}: {}", message.role, message.content);
    }
    if transcript.chars().count() > MAX_SOURCE_CHARS {
        let skip = transcript.chars().count() - MAX_SOURCE_CHARS;
        transcript = transcript.chars().skip(skip).collect();
    }
    transcript
}

fn build_prompt(transcript: &str) -> String {
    format!(
        "Analyze this dialog history and produce a compact memory note.\n\n\
         Dialog history:\n{transcript}\n\
         Respond with JSON only, no extra text, with fields:\n\
         - summary: 2-3 sentences covering the main topics and actions\n\
         - topics: list of discussed topic names\n\
         - user_preferences: preferences learned about the user, if any\n"
    )
}

/// Tolerant JSON extraction: models routinely wrap output in markdown fences.
fn parse_output(raw: &str) -> Option<CompressionOutput> {
    let trimmed = raw.trim();
    let candidate = if trimmed.starts_with("```") {
        let inner = trimmed.trim_start_matches("```");
        let inner = inner.strip_prefix("json").unwrap_or(inner);
        inner.split("```").next().unwrap_or("")
    } else {
        trimmed
    };
    serde_json::from_str(candidate.trim()).ok()
}
