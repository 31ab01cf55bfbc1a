//! Failure taxonomy for the session loop.
//!
//! Two tiers: errors that kill the whole session (the scheduler reclaims it
//! on the next eviction sweep) and errors contained to a single stream entry
//! (logged, loop continues). Everything else in the crate uses plain
//! `anyhow::Result`.

use thiserror::Error;

/// Fatal to the owning session. Never caught inside the message loop.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Stream, lock, or state store unreachable.
    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// Tool catalog could not be fetched at session start. The admission
    /// pass retries once the scheduler has reaped the dead session.
    #[error("tool provider startup failed: {0}")]
    ToolProviderStartup(#[source] anyhow::Error),
}

/// Contained at the processing boundary of one stream entry.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("llm request failed: {0}")]
    Llm(#[source] anyhow::Error),

    #[error("gateway delivery failed: {0}")]
    Gateway(#[source] anyhow::Error),

    #[error("store operation failed: {0}")]
    Store(#[source] anyhow::Error),

    #[error("malformed stream payload: {0}")]
    MalformedPayload(String),
}
