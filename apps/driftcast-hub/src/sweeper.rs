//! Background cleanup sweeper.
//!
//! Periodically scans the remote store for stale or phantom sessions and
//! ends them through the coordinator, so the termination policy has a
//! single source of truth. Guards itself with an error-rate circuit
//! breaker: recognized backend-internal assertion failures open the
//! circuit immediately, repeated ordinary failures stop the sweeper
//! entirely, and both paths schedule self-rescheduling recovery attempts
//! instead of hammering a misbehaving backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::StreamCoordinator;
use crate::error::StreamError;
use crate::store::{SharedStore, StoreError};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Fixed cycle period.
    pub interval: Duration,
    /// Sessions with no activity for longer than this are ended with
    /// reason `timeout`.
    pub stale_after: Duration,
    /// A cycle is skipped while the most recent error is younger than this.
    pub error_cooldown: Duration,
    /// Delay between opening the circuit and the recovery attempt.
    pub recovery_delay: Duration,
    /// Delay before restarting after a full stop.
    pub restart_delay: Duration,
    /// Consecutive ordinary errors tolerated before stopping entirely.
    pub max_consecutive_errors: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(60 * 60),
            error_cooldown: Duration::from_secs(30),
            recovery_delay: Duration::from_secs(120),
            restart_delay: Duration::from_secs(300),
            max_consecutive_errors: 3,
        }
    }
}

/// Error-tracking state owned by one run of the sweep loop. A restarted
/// sweeper begins from a fresh instance.
#[derive(Debug, Default)]
struct SweeperErrorState {
    error_count: u32,
    last_error_at: Option<Instant>,
    circuit_open: bool,
    opened_at: Option<Instant>,
}

impl SweeperErrorState {
    fn record_error(&mut self, now: Instant) {
        self.error_count += 1;
        self.last_error_at = Some(now);
    }

    fn open_circuit(&mut self, now: Instant) {
        self.circuit_open = true;
        self.opened_at = Some(now);
    }

    /// A failed recovery attempt pushes the next attempt out by the full
    /// recovery delay again.
    fn reschedule_recovery(&mut self, now: Instant) {
        self.opened_at = Some(now);
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn recovery_due(&self, now: Instant, delay: Duration) -> bool {
        self.opened_at
            .map(|at| now.duration_since(at) >= delay)
            .unwrap_or(true)
    }

    fn in_cooldown(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_error_at
            .map(|at| now.duration_since(at) < cooldown)
            .unwrap_or(false)
    }
}

pub struct CleanupSweeper {
    store: SharedStore,
    coordinator: StreamCoordinator,
    config: SweeperConfig,
}

/// Cancellation handle for a running sweeper, covering restarts too.
pub struct SweeperHandle {
    cancel: CancellationToken,
}

impl SweeperHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct CycleSummary {
    stale_ended: usize,
    phantoms_ended: usize,
}

impl CleanupSweeper {
    pub fn new(
        store: SharedStore,
        coordinator: StreamCoordinator,
        config: SweeperConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            coordinator,
            config,
        })
    }

    pub fn start(self: &Arc<Self>) -> SweeperHandle {
        let cancel = CancellationToken::new();
        tokio::spawn(run_loop(Arc::clone(self), cancel.clone()));
        SweeperHandle { cancel }
    }

    async fn cycle(&self) -> Result<CycleSummary, StreamError> {
        let mut summary = CycleSummary::default();

        // An unrepresentable window must skip the scan, not collapse the
        // cutoff to now and time out every live session.
        let stale = match chrono::Duration::from_std(self.config.stale_after) {
            Err(_) => {
                warn!(
                    stale_after_secs = self.config.stale_after.as_secs(),
                    "staleness window out of range; skipping stale scan"
                );
                Vec::new()
            }
            Ok(window) => {
                let cutoff = Utc::now() - window;
                match self.store.list_stale_active(cutoff).await {
                    Ok(sessions) => sessions,
                    Err(StoreError::QueryUnsupported) => {
                        // Simplified fallback scan; missing index support is
                        // not a fatal condition.
                        debug!("indexed staleness query unavailable; scanning active set");
                        self.store
                            .list_active()
                            .await?
                            .into_iter()
                            .filter(|session| session.last_activity_at < cutoff)
                            .collect()
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };
        for session in stale {
            self.coordinator
                .end(&session.id, driftcast_core::EndReason::Timeout, None)
                .await?;
            summary.stale_ended += 1;
        }

        // Same termination policy the coordinator applies on leave.
        let active = self.store.list_active().await?;
        for session in active {
            if session.should_auto_end() {
                let reason = session.auto_end_reason();
                self.coordinator.end(&session.id, reason, None).await?;
                summary.phantoms_ended += 1;
            }
        }

        summary.stale_ended += self.cleanup_orphaned_pointers().await;
        Ok(summary)
    }

    /// Orphaned-pointer pass. Known gap: the tracker's cleanup needs a
    /// user id and the sweeper has no per-user trigger yet, so this pass
    /// reports zero work; pointers are reclaimed lazily by the orphan
    /// check on the next create and by ghost-state recovery.
    async fn cleanup_orphaned_pointers(&self) -> usize {
        trace!("orphaned-pointer pass pending per-user triggering");
        0
    }

    /// Recovery attempt: a cheap read against the store. Success closes
    /// the circuit and resets the error counter.
    async fn probe(&self) -> Result<(), StoreError> {
        self.store.list_active().await.map(|_| ())
    }
}

async fn run_loop(sweeper: Arc<CleanupSweeper>, cancel: CancellationToken) {
    let mut state = SweeperErrorState::default();
    let mut ticker = tokio::time::interval(sweeper.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The immediate first tick would sweep before anything is stale.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("sweeper cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }
        let now = Instant::now();

        if state.circuit_open {
            if !state.recovery_due(now, sweeper.config.recovery_delay) {
                debug!("circuit open; skipping sweep cycle");
                continue;
            }
            match sweeper.probe().await {
                Ok(()) => {
                    info!("sweeper recovery probe succeeded; circuit closed");
                    state.reset();
                }
                Err(err) => {
                    warn!(error = %err, "sweeper recovery probe failed; rescheduling");
                    state.reschedule_recovery(now);
                }
            }
            continue;
        }

        if state.in_cooldown(now, sweeper.config.error_cooldown) {
            debug!("recent sweep error; skipping cycle during cool-down");
            continue;
        }

        match sweeper.cycle().await {
            Ok(summary) => {
                state.reset();
                if summary.stale_ended > 0 || summary.phantoms_ended > 0 {
                    info!(
                        stale = summary.stale_ended,
                        phantoms = summary.phantoms_ended,
                        "sweep cycle ended sessions"
                    );
                }
            }
            Err(err) => {
                state.record_error(now);
                if is_internal_assertion(&err) {
                    error!(error = %err, "backend internal assertion; opening sweeper circuit");
                    state.open_circuit(now);
                } else if state.error_count >= sweeper.config.max_consecutive_errors {
                    error!(
                        errors = state.error_count,
                        "sweeper stopping after consecutive errors; restart scheduled"
                    );
                    schedule_restart(sweeper, cancel);
                    return;
                } else {
                    warn!(error = %err, errors = state.error_count, "sweep cycle failed");
                }
            }
        }
    }
}

/// Delayed restart with a fresh error state. A restarted loop that fails
/// again schedules the next restart itself rather than giving up.
fn schedule_restart(sweeper: Arc<CleanupSweeper>, cancel: CancellationToken) {
    let delay = sweeper.config.restart_delay;
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        info!("restarting sweeper");
        tokio::spawn(run_loop(sweeper, cancel));
    });
}

fn is_internal_assertion(err: &StreamError) -> bool {
    match err {
        StreamError::Store(store_err) => store_err.is_internal_assertion(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CoordinatorConfig, StreamCoordinator};
    use crate::media::NullMediaChannel;
    use crate::store::{MemoryStreamStore, StreamStore};
    use crate::tracker::ParticipationTracker;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use driftcast_core::{
        ActiveStreamPointer, EndReason, Participant, StreamSession,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    /// Delegating store whose list queries can be switched into failure
    /// modes, for driving the circuit breaker.
    struct FlakyStore {
        inner: Arc<MemoryStreamStore>,
        failure: Mutex<Option<&'static str>>,
        list_calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryStreamStore>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                failure: Mutex::new(None),
                list_calls: AtomicU32::new(0),
            })
        }

        fn fail_with(&self, message: Option<&'static str>) {
            *self.failure.lock().unwrap() = message;
        }

        fn check(&self) -> Result<(), StoreError> {
            match *self.failure.lock().unwrap() {
                Some(message) => Err(StoreError::Backend(message.to_string())),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl StreamStore for FlakyStore {
        async fn get_session(&self, id: &str) -> Result<Option<StreamSession>, StoreError> {
            self.inner.get_session(id).await
        }
        async fn put_session(&self, s: &StreamSession) -> Result<(), StoreError> {
            self.inner.put_session(s).await
        }
        async fn patch_participants(&self, s: &StreamSession) -> Result<(), StoreError> {
            self.inner.patch_participants(s).await
        }
        async fn mark_ended(&self, id: &str, reason: EndReason) -> Result<(), StoreError> {
            self.inner.mark_ended(id, reason).await
        }
        async fn list_active(&self) -> Result<Vec<StreamSession>, StoreError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.list_active().await
        }
        async fn list_stale_active(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<StreamSession>, StoreError> {
            self.check()?;
            self.inner.list_stale_active(cutoff).await
        }
        async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_session(id).await
        }
        async fn get_pointer(&self, id: &str) -> Result<Option<ActiveStreamPointer>, StoreError> {
            self.inner.get_pointer(id).await
        }
        async fn set_pointer(&self, user: &str, stream: &str) -> Result<(), StoreError> {
            self.inner.set_pointer(user, stream).await
        }
        async fn clear_pointer(&self, user: &str) -> Result<(), StoreError> {
            self.inner.clear_pointer(user).await
        }
        async fn end_stream_and_cleanup(
            &self,
            id: &str,
            reason: EndReason,
        ) -> Result<bool, StoreError> {
            self.inner.end_stream_and_cleanup(id, reason).await
        }
        async fn subscribe_active(
            &self,
        ) -> Result<broadcast::Receiver<Vec<StreamSession>>, StoreError> {
            self.inner.subscribe_active().await
        }
    }

    fn sweeper_fixture(
        store: Arc<dyn StreamStore>,
        config: SweeperConfig,
    ) -> (Arc<CleanupSweeper>, StreamCoordinator) {
        let tracker = ParticipationTracker::new(store.clone());
        let media = NullMediaChannel::new();
        let (coordinator, _task) = StreamCoordinator::spawn(
            store.clone(),
            tracker,
            media,
            CoordinatorConfig::immediate(),
        );
        (
            CleanupSweeper::new(store, coordinator.clone(), config),
            coordinator,
        )
    }

    fn fast_config() -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(3600),
            error_cooldown: Duration::from_millis(150),
            recovery_delay: Duration::from_millis(300),
            restart_delay: Duration::from_millis(400),
            max_consecutive_errors: 2,
        }
    }

    async fn seed_stale_session(store: &MemoryStreamStore) -> String {
        let mut session = StreamSession::new("old", Participant::host("h", "H", None));
        session.last_activity_at = Utc::now() - chrono::Duration::hours(3);
        let id = session.id.clone();
        store.seed_session(session).await;
        id
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sessions_are_ended_with_timeout_reason() {
        let memory = MemoryStreamStore::new();
        let id = seed_stale_session(&memory).await;
        let (sweeper, _coordinator) = sweeper_fixture(memory.clone(), fast_config());
        let handle = sweeper.start();

        tokio::time::sleep(Duration::from_millis(250)).await;

        let stored = memory.get_session(&id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.end_reason, Some(EndReason::Timeout));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn phantom_sessions_are_ended_within_one_cycle() {
        let memory = MemoryStreamStore::new();
        let mut session = StreamSession::new("ghost town", Participant::host("h", "H", None));
        session.participants.clear();
        session.viewer_count = 0;
        let id = session.id.clone();
        memory.seed_session(session).await;

        let (sweeper, _coordinator) = sweeper_fixture(memory.clone(), fast_config());
        let handle = sweeper.start();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let stored = memory.get_session(&id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.end_reason, Some(EndReason::Empty));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_staleness_window_skips_the_stale_scan() {
        let memory = MemoryStreamStore::new();
        let mut session = StreamSession::new("fresh", Participant::host("h", "H", None));
        session.add_participant(Participant::viewer("v", "V", None));
        let id = session.id.clone();
        memory.seed_session(session).await;

        let mut config = fast_config();
        config.stale_after = Duration::from_secs(u64::MAX);
        let (sweeper, _coordinator) = sweeper_fixture(memory.clone(), config);
        let handle = sweeper.start();

        tokio::time::sleep(Duration::from_millis(350)).await;

        let stored = memory.get_session(&id).await.unwrap().unwrap();
        assert!(stored.is_active, "live sessions must survive a skipped scan");
        assert_eq!(stored.end_reason, None);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn internal_assertion_opens_circuit_and_recovery_resumes() {
        let memory = MemoryStreamStore::new();
        let flaky = FlakyStore::new(memory.clone());
        let (sweeper, _coordinator) = sweeper_fixture(flaky.clone(), fast_config());

        flaky.fail_with(Some("INTERNAL ASSERTION FAILED: unexpected state"));
        let handle = sweeper.start();

        // First cycle errors and opens the circuit.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let calls_after_open = flaky.list_calls.load(Ordering::SeqCst);

        // While open and before the recovery delay, no further store scans.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flaky.list_calls.load(Ordering::SeqCst), calls_after_open);

        // Heal the backend; the recovery probe closes the circuit and
        // sweeping resumes.
        flaky.fail_with(None);
        let id = seed_stale_session(&memory).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        let stored = memory.get_session(&id).await.unwrap().unwrap();
        assert!(!stored.is_active, "sweeping should resume after recovery");
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_errors_stop_the_sweeper_then_restart() {
        let memory = MemoryStreamStore::new();
        let flaky = FlakyStore::new(memory.clone());
        let mut config = fast_config();
        config.error_cooldown = Duration::ZERO;
        let (sweeper, _coordinator) = sweeper_fixture(flaky.clone(), config);

        flaky.fail_with(Some("connection reset by peer"));
        let handle = sweeper.start();

        // Two cycles hit the threshold and stop the loop.
        tokio::time::sleep(Duration::from_millis(350)).await;
        let calls_at_stop = flaky.list_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            flaky.list_calls.load(Ordering::SeqCst),
            calls_at_stop,
            "stopped sweeper must not schedule new cycles"
        );

        // After the restart delay the loop comes back with fresh state.
        flaky.fail_with(None);
        let id = seed_stale_session(&memory).await;
        tokio::time::sleep(Duration::from_millis(700)).await;
        let stored = memory.get_session(&id).await.unwrap().unwrap();
        assert!(!stored.is_active, "restarted sweeper should resume sweeping");
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_restart() {
        let memory = MemoryStreamStore::new();
        let flaky = FlakyStore::new(memory.clone());
        let mut config = fast_config();
        config.error_cooldown = Duration::ZERO;
        let (sweeper, _coordinator) = sweeper_fixture(flaky.clone(), config);

        flaky.fail_with(Some("connection reset by peer"));
        let handle = sweeper.start();
        tokio::time::sleep(Duration::from_millis(350)).await;
        handle.shutdown();

        flaky.fail_with(None);
        let calls_at_shutdown = flaky.list_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(flaky.list_calls.load(Ordering::SeqCst), calls_at_shutdown);
    }
}
