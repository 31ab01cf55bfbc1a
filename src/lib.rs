//! taskpilot: a multi-tenant agent session scheduler.
//!
//! Users push messages onto per-user Redis streams; a bounded pool of agent
//! sessions consumes them, asks an LLM what to do, and runs side-effecting
//! tools only after explicit user confirmation. Conversation state lives in
//! Redis with a TTL and is kept small by structural trimming and periodic
//! LLM-driven semantic compression.

pub mod config;
pub mod confirm;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod lock;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;
pub mod tools;
pub mod util;
