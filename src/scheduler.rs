//! Bounded session pool. On every tick the scheduler reaps finished
//! sessions, evicts idle ones, and admits waiting users up to capacity.
//! Admission is guarded by the distributed lock, so several scheduler
//! processes can share one Redis without double-owning a user.

use crate::config::SchedulerConfig;
use crate::lock::SessionLock;
use crate::session::{AgentSession, SessionContext};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct SessionHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    last_active: Arc<Mutex<Instant>>,
}

impl SessionHandle {
    fn idle_for(&self) -> Duration {
        Instant::now().duration_since(*self.last_active.lock())
    }
}

pub struct Scheduler {
    ctx: SessionContext,
    lock: SessionLock,
    max_active: usize,
    tick_interval: Duration,
    idle_timeout: Duration,
    shutdown_grace: Duration,
    active: HashMap<i64, SessionHandle>,
}

impl Scheduler {
    pub fn new(ctx: SessionContext, config: &SchedulerConfig) -> Self {
        let lock = SessionLock::new(Arc::clone(&ctx.kv), config.idle_timeout());
        Self {
            ctx,
            lock,
            max_active: config.max_active_sessions,
            tick_interval: config.tick_interval(),
            idle_timeout: config.idle_timeout(),
            shutdown_grace: config.shutdown_grace(),
            active: HashMap::new(),
        }
    }

    /// Tick until `shutdown` fires, then drain every active session.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            max_active = self.max_active,
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "scheduler started"
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        self.drain().await;
        tracing::info!("scheduler stopped");
        Ok(())
    }

    async fn tick(&mut self) {
        self.reap_finished().await;
        self.evict_idle().await;
        self.admit_waiting().await;
    }

    /// Sessions that exited on their own (fatal error or external cancel)
    /// still hold their lock until reaped here.
    async fn reap_finished(&mut self) {
        let finished: Vec<i64> = self
            .active
            .iter()
            .filter(|(_, h)| h.task.is_finished())
            .map(|(uid, _)| *uid)
            .collect();
        for user_id in finished {
            if let Some(handle) = self.active.remove(&user_id) {
                if let Err(e) = handle.task.await {
                    tracing::warn!(user_id, "session task panicked: {e}");
                }
            }
            self.release_lock(user_id).await;
            tracing::info!(user_id, "session reaped");
        }
    }

    async fn evict_idle(&mut self) {
        let idle: Vec<i64> = self
            .active
            .iter()
            .filter(|(_, h)| h.idle_for() >= self.idle_timeout)
            .map(|(uid, _)| *uid)
            .collect();
        for user_id in idle {
            tracing::info!(user_id, "evicting idle session");
            self.stop_session(user_id).await;
        }
    }

    /// Cancel, wait out the grace period, then abort. The lock is released
    /// either way; an aborted session may lose unsynced state.
    async fn stop_session(&mut self, user_id: i64) {
        let Some(mut handle) = self.active.remove(&user_id) else {
            return;
        };
        handle.cancel.cancel();
        if tokio::time::timeout(self.shutdown_grace, &mut handle.task)
            .await
            .is_err()
        {
            tracing::warn!(user_id, "session ignored cancellation, aborting");
            handle.task.abort();
        }
        self.release_lock(user_id).await;
    }

    async fn admit_waiting(&mut self) {
        if self.active.len() >= self.max_active {
            return;
        }
        let pending = match self.ctx.stream.pending_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!("pending user scan failed: {e}");
                return;
            }
        };

        for user_id in pending {
            if self.active.len() >= self.max_active {
                break;
            }
            if self.active.contains_key(&user_id) {
                continue;
            }
            match self.lock.acquire(user_id).await {
                Ok(true) => self.spawn_session(user_id),
                Ok(false) => {
                    tracing::debug!(user_id, "user owned by another process");
                }
                Err(e) => {
                    tracing::warn!(user_id, "lock acquisition failed: {e}");
                }
            }
        }
    }

    fn spawn_session(&mut self, user_id: i64) {
        let cancel = CancellationToken::new();
        let last_active = Arc::new(Mutex::new(Instant::now()));
        let session = AgentSession::new(
            user_id,
            self.ctx.clone(),
            cancel.clone(),
            Arc::clone(&last_active),
        );
        let task = tokio::spawn(async move {
            if let Err(e) = session.run().await {
                tracing::error!(user_id, "session failed: {e}");
            }
        });
        self.active.insert(
            user_id,
            SessionHandle {
                task,
                cancel,
                last_active,
            },
        );
        tracing::info!(user_id, active = self.active.len(), "session admitted");
    }

    async fn drain(&mut self) {
        let users: Vec<i64> = self.active.keys().copied().collect();
        tracing::info!(sessions = users.len(), "draining sessions");
        for user_id in users {
            self.stop_session(user_id).await;
        }
    }

    async fn release_lock(&self, user_id: i64) {
        if let Err(e) = self.lock.release(user_id).await {
            tracing::warn!(user_id, "lock release failed: {e}");
        }
    }

    #[cfg(test)]
    fn active_sessions(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::confirm::{ConfirmationStore, KvConfirmationStore};
    use crate::gateway::{ConfirmButtons, Gateway};
    use crate::llm::{Decision, LanguageModel};
    use crate::state::RelevantContext;
    use crate::store::{keys, EventStream, KvStore, MemoryStore};
    use crate::tools::{ToolOutcome, ToolProvider, ToolSpec};
    use async_trait::async_trait;

    struct NullGateway;

    #[async_trait]
    impl Gateway for NullGateway {
        async fn send_text(&self, _user_id: i64, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn send_confirmation(
            &self,
            _user_id: i64,
            _text: &str,
            _buttons: &ConfirmButtons,
        ) -> Result<()> {
            Ok(())
        }
        async fn answer_callback(&self, _callback_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct SilentModel;

    #[async_trait]
    impl LanguageModel for SilentModel {
        async fn decide(
            &self,
            _context: &RelevantContext,
            _message: &str,
            _tools: &[ToolSpec],
        ) -> Result<Decision> {
            Ok(Decision::default())
        }
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok("{}".to_string())
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolProvider for NoTools {
        async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
            Ok(Vec::new())
        }
        async fn call_tool(&self, _name: &str, _arguments: &serde_json::Value) -> Result<ToolOutcome> {
            Ok(ToolOutcome::ok(serde_json::json!({})))
        }
    }

    fn test_context(store: &Arc<MemoryStore>) -> SessionContext {
        let kv: Arc<dyn KvStore> = store.clone();
        let stream: Arc<dyn EventStream> = store.clone();
        let confirmations: Arc<dyn ConfirmationStore> =
            Arc::new(KvConfirmationStore::new(Arc::clone(&kv)));
        SessionContext {
            kv,
            stream,
            gateway: Arc::new(NullGateway),
            llm: Arc::new(SilentModel),
            tools: Arc::new(NoTools),
            confirmations,
        }
    }

    #[tokio::test]
    async fn admission_respects_capacity() {
        let store = Arc::new(MemoryStore::new());
        for user_id in 1..=15 {
            store.append(user_id, r#"{"text": "hi"}"#);
        }
        let config = SchedulerConfig::default();
        let mut sched = Scheduler::new(test_context(&store), &config);

        sched.tick().await;
        assert_eq!(sched.active_sessions(), 10);

        // Another tick must not overshoot.
        sched.tick().await;
        assert_eq!(sched.active_sessions(), 10);
        sched.drain().await;
    }

    #[tokio::test]
    async fn tracked_user_is_not_admitted_twice() {
        let store = Arc::new(MemoryStore::new());
        store.append(9, r#"{"text": "hi"}"#);
        let config = SchedulerConfig::default();
        let mut sched = Scheduler::new(test_context(&store), &config);

        sched.tick().await;
        sched.tick().await;
        assert_eq!(sched.active_sessions(), 1);
        sched.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_evicted_and_readmittable() {
        let store = Arc::new(MemoryStore::new());
        store.append(9, r#"{"text": "hi"}"#);
        let config = SchedulerConfig::default();
        let mut sched = Scheduler::new(test_context(&store), &config);

        sched.tick().await;
        assert_eq!(sched.active_sessions(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        sched.reap_finished().await;
        sched.evict_idle().await;
        assert_eq!(sched.active_sessions(), 0);
        assert!(store.get(&keys::lock(9)).await.unwrap().is_none());

        // Stream key still exists, so the user is admitted again.
        sched.tick().await;
        assert_eq!(sched.active_sessions(), 1);
        sched.drain().await;
    }

    #[tokio::test]
    async fn drain_stops_everything() {
        let store = Arc::new(MemoryStore::new());
        for user_id in 1..=3 {
            store.append(user_id, r#"{"text": "hi"}"#);
        }
        let config = SchedulerConfig::default();
        let mut sched = Scheduler::new(test_context(&store), &config);

        sched.tick().await;
        assert_eq!(sched.active_sessions(), 3);
        sched.drain().await;
        assert_eq!(sched.active_sessions(), 0);
    }
}
