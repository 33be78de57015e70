//! Synchronizer lifecycle.
//!
//! ```text
//! Idle ─► Restoring ─► Probing ─► CatchingUp ─► Synchronized (live tail)
//!             │            │           │               │
//!             └────────────┴───────────┴───────────────┴─► Failed | Stopped
//! ```
//!
//! [`Synchronizer::start`] spawns the run task and returns a [`SyncHandle`]
//! for observing state, reading status and stopping the run.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::catchup::{CatchUp, CatchUpConfig, CatchUpOutcome};
use crate::error::{Error, FetchError, Result};
use crate::events::{EventBus, SyncEvent};
use crate::registry::{ENDPOINT_ROOT, RegistryClient};
use crate::retry::{RetryPolicy, is_retryable, with_smart_retry};
use crate::scheduler::{RateScheduler, SchedulerConfig};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::store::ProgressStore;
use crate::tail::LiveTail;

/// Lifecycle state of a synchronizer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Restoring,
    Probing,
    CatchingUp,
    Synchronized,
    Failed { reason: String },
    Stopped,
}

impl SyncState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Stopped)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Restoring => "restoring",
            Self::Probing => "probing",
            Self::CatchingUp => "catching_up",
            Self::Synchronized => "synchronized",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub low_water_mark: u64,
    /// Last probed remote sequence.
    pub remote_seq: Option<u64>,
    pub pending_blocks: usize,
    pub known_packages: usize,
    pub synchronized: bool,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub catch_up: CatchUpConfig,
    pub queries_per_second: u32,
    /// Wait between live-tail polls that returned nothing.
    pub tail_delay: Duration,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catch_up: CatchUpConfig::default(),
            queries_per_second: 10,
            tail_delay: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

/// Wires the registry, the store and the event bus into one run.
pub struct Synchronizer {
    config: SyncConfig,
    client: Arc<dyn RegistryClient>,
    store: ProgressStore,
    events: EventBus,
}

struct Run {
    config: SyncConfig,
    client: Arc<dyn RegistryClient>,
    store: ProgressStore,
    events: EventBus,
    scheduler: RateScheduler,
    state: watch::Sender<SyncState>,
    remote_seq: Arc<Mutex<Option<u64>>>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl Synchronizer {
    #[must_use]
    pub fn new(config: SyncConfig, client: Arc<dyn RegistryClient>, store: ProgressStore) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            client,
            store,
            events,
        }
    }

    /// Bus the run will publish on. Subscribe before [`Self::start`] to see
    /// every event.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Spawn the run task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(self) -> SyncHandle {
        let (trigger, shutdown) = shutdown::channel();
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let remote_seq = Arc::new(Mutex::new(None));
        let scheduler = RateScheduler::new(SchedulerConfig::new(
            self.config.queries_per_second,
            self.config.catch_up.concurrency,
        ));

        let run = Run {
            config: self.config,
            client: self.client,
            store: self.store.clone(),
            events: self.events.clone(),
            scheduler,
            state: state_tx,
            remote_seq: Arc::clone(&remote_seq),
            trigger: trigger.clone(),
            shutdown,
        };
        let task = tokio::spawn(run.execute());

        SyncHandle {
            state: state_rx,
            remote_seq,
            store: self.store,
            events: self.events,
            trigger,
            task: Some(task),
        }
    }
}

impl Run {
    async fn execute(self) {
        let outcome = self.drive().await;
        match outcome {
            Ok(()) => {
                self.transition(SyncState::Stopped);
            }
            Err(err) => {
                error!(error = %err, "synchronizer failed");
                self.trigger.trigger();
                self.transition(SyncState::Failed {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn transition(&self, next: SyncState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            info!(from = %previous, to = %next, "synchronizer state");
        }
    }

    async fn drive(&self) -> Result<()> {
        self.transition(SyncState::Restoring);
        let restored = self.store.load().await?;
        let local = restored.low_water_mark;
        info!(
            low_water_mark = local,
            known_packages = restored.known_packages.len(),
            blocks = restored.blocks.len(),
            "progress restored"
        );

        self.transition(SyncState::Probing);
        let Some(remote) = self.probe().await? else {
            return Ok(());
        };
        *self
            .remote_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(remote);
        let target = if remote < local {
            warn!(remote, local, "remote sequence is behind the local mark");
            local
        } else {
            remote
        };

        self.transition(SyncState::CatchingUp);
        let catch_up = CatchUp::new(
            Arc::clone(&self.client),
            self.scheduler.clone(),
            self.store.clone(),
            self.events.clone(),
            self.config.catch_up,
            self.shutdown.clone(),
        );
        let summary = match catch_up.run(local, target).await? {
            CatchUpOutcome::Completed(summary) => summary,
            CatchUpOutcome::Interrupted(_) => return Ok(()),
        };

        self.events.publish(SyncEvent::Synchronized {
            sequence: summary.low_water_mark,
        });
        self.transition(SyncState::Synchronized);

        let tail = LiveTail::new(
            Arc::clone(&self.client),
            self.scheduler.clone(),
            self.store.clone(),
            self.events.clone(),
            self.config.tail_delay,
            self.shutdown.clone(),
        );
        tail.run(summary.low_water_mark).await?;
        Ok(())
    }

    /// Remote `update_seq`, or `None` if shutdown was raised first.
    async fn probe(&self) -> Result<Option<u64>> {
        let policy = RetryPolicy::probe(self.config.catch_up.max_retries);
        let request = with_smart_retry(&policy, move || {
            request_update_seq(&self.scheduler, self.client.as_ref())
        });

        let mut shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            () = shutdown.wait() => return Ok(None),
            outcome = request => outcome,
        };
        match outcome.result {
            Ok(seq) => {
                info!(
                    update_seq = seq,
                    attempts = outcome.attempts,
                    elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
                    "remote sequence probed"
                );
                Ok(Some(seq))
            }
            Err(err) if is_retryable(&err) => Err(Error::RetriesExhausted {
                operation: "probe update_seq".to_string(),
                attempts: outcome.attempts,
                last_error: err.to_string(),
            }),
            Err(err) => Err(err),
        }
    }
}

/// One `update_seq` request under the scheduler. A 429 penalizes the root
/// endpoint and asks again; the concurrency permit is not held while waiting.
async fn request_update_seq(scheduler: &RateScheduler, client: &dyn RegistryClient) -> Result<u64> {
    loop {
        let permit = scheduler.acquire(ENDPOINT_ROOT).await?;
        let response = client.update_seq().await;
        drop(permit);
        match response {
            Err(FetchError::RateLimited) => scheduler.penalize(ENDPOINT_ROOT).await,
            other => return other.map_err(Error::from),
        }
    }
}

/// Control and observation handle for a started run. Dropping the handle
/// raises shutdown.
pub struct SyncHandle {
    state: watch::Receiver<SyncState>,
    remote_seq: Arc<Mutex<Option<u64>>>,
    store: ProgressStore,
    events: EventBus,
    trigger: ShutdownTrigger,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let snapshot = self.store.snapshot().await?;
        let state = self.state();
        Ok(SyncStatus {
            synchronized: state == SyncState::Synchronized,
            state,
            low_water_mark: snapshot.low_water_mark,
            remote_seq: *self.remote_seq.lock().unwrap_or_else(PoisonError::into_inner),
            pending_blocks: snapshot.blocks_pending,
            known_packages: snapshot.known_packages,
        })
    }

    /// Resolves with the mark once catch-up completes. Fails if the run
    /// ends first.
    pub async fn wait_synchronized(&self) -> Result<u64> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == SyncState::Synchronized || s.is_terminal())
            .await
            .map_err(|_| Error::Runtime("synchronizer task ended".to_string()))?
            .clone();
        match reached {
            SyncState::Synchronized => self.store.low_water_mark().await,
            SyncState::Failed { reason } => Err(Error::Runtime(reason)),
            _ => Err(Error::Cancelled("synchronizer stopped".to_string())),
        }
    }

    /// Raise shutdown and wait for the run task to exit. Returns the final
    /// state: `Stopped`, or `Failed` if the run had already failed.
    pub async fn stop(&mut self) -> Result<SyncState> {
        self.trigger.trigger();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Runtime(format!("synchronizer task panicked: {e}")))?;
        }
        Ok(self.state())
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.trigger.trigger();
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("state", &*self.state.borrow())
            .field("running", &self.task.as_ref().is_some_and(|t| !t.is_finished()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChangesResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers 429 to the first `update_seq`, then 42.
    #[derive(Default)]
    struct LimitedOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RegistryClient for LimitedOnce {
        async fn update_seq(&self) -> std::result::Result<u64, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(FetchError::RateLimited)
            } else {
                Ok(42)
            }
        }

        async fn changes(
            &self,
            _since: u64,
            _limit: Option<u64>,
        ) -> std::result::Result<ChangesResponse, FetchError> {
            Ok(ChangesResponse::Exhausted)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_update_seq_frees_its_permit_while_waiting() {
        let scheduler = RateScheduler::new(SchedulerConfig::new(10, 1));
        let client = Arc::new(LimitedOnce::default());
        let request = {
            let scheduler = scheduler.clone();
            let client = Arc::clone(&client);
            tokio::spawn(async move { request_update_seq(&scheduler, client.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.available_permits(), 1);
        drop(scheduler.acquire("changes").await.unwrap());

        assert_eq!(request.await.unwrap().unwrap(), 42);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stats(ENDPOINT_ROOT).penalties, 1);
    }

    #[test]
    fn terminal_states() {
        assert!(SyncState::Stopped.is_terminal());
        assert!(SyncState::Failed { reason: "x".into() }.is_terminal());
        assert!(!SyncState::Synchronized.is_terminal());
    }

    #[test]
    fn state_serializes_tagged() {
        let json = serde_json::to_string(&SyncState::CatchingUp).unwrap();
        assert_eq!(json, r#"{"state":"catching_up"}"#);
        let failed = SyncState::Failed {
            reason: "boom".into(),
        };
        assert_eq!(failed.to_string(), "failed: boom");
    }
}
