//! Request scheduling against the registry.
//!
//! Two independent limits apply to every request:
//!
//! - **Rate**: at most `queries_per_second` requests start per endpoint per
//!   one-second window. Callers over the ceiling park on a shared "next
//!   second" tick. When the tick fires the window resets and every parked
//!   caller wakes at once and re-checks the counter; callers that lose the
//!   race park again for the following tick.
//! - **Concurrency**: at most `concurrency` requests are in flight across all
//!   endpoints, enforced with a semaphore permit held for the request's life.
//!
//! The scheduler never inspects responses. After an HTTP 429 the caller calls
//! [`RateScheduler::penalize`], which closes the endpoint for one full window
//! starting at the penalty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

const WINDOW: Duration = Duration::from_secs(1);

/// Limits applied by a [`RateScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Requests allowed to start per endpoint per second (min 1).
    pub queries_per_second: u32,
    /// Requests allowed in flight at once (min 1).
    pub concurrency: usize,
}

impl SchedulerConfig {
    #[must_use]
    pub fn new(queries_per_second: u32, concurrency: usize) -> Self {
        Self {
            queries_per_second: queries_per_second.max(1),
            concurrency: concurrency.max(1),
        }
    }
}

/// Per-endpoint counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    /// Requests cleared to start.
    pub issued: u64,
    /// Requests that had to wait for at least one tick.
    pub delayed: u64,
    /// 429 penalties applied.
    pub penalties: u64,
}

#[derive(Debug)]
struct EndpointState {
    window_start: Instant,
    count: u32,
    timer_armed: bool,
    /// When the pending tick may fire. A penalty can push it out.
    release_at: Instant,
    tick: watch::Sender<u64>,
    stats: EndpointStats,
}

impl EndpointState {
    fn new(now: Instant) -> Self {
        let (tick, _) = watch::channel(0);
        Self {
            window_start: now,
            count: 0,
            timer_armed: false,
            release_at: now,
            tick,
            stats: EndpointStats::default(),
        }
    }

    /// Start a fresh window if the current one has lapsed and no tick is
    /// pending (a pending tick performs the reset itself).
    fn roll(&mut self, now: Instant) {
        if !self.timer_armed && now >= self.window_start + WINDOW {
            self.window_start = now;
            self.count = 0;
        }
    }
}

#[derive(Debug)]
struct Inner {
    queries_per_second: u32,
    permits: Arc<Semaphore>,
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl Inner {
    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, EndpointState>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared rate and concurrency limiter. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RateScheduler {
    inner: Arc<Inner>,
}

/// Concurrency slot; released on drop.
#[derive(Debug)]
pub struct SchedulerPermit {
    _permit: OwnedSemaphorePermit,
}

enum Clearance {
    Go,
    Wait(watch::Receiver<u64>),
}

impl RateScheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let config = SchedulerConfig::new(config.queries_per_second, config.concurrency);
        Self {
            inner: Arc::new(Inner {
                queries_per_second: config.queries_per_second,
                permits: Arc::new(Semaphore::new(config.concurrency)),
                endpoints: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolves once a new request against `endpoint` fits under the rate
    /// ceiling.
    pub async fn schedule(&self, endpoint: &str) {
        let mut delayed = false;
        loop {
            match self.try_clear(endpoint, delayed) {
                Clearance::Go => return,
                Clearance::Wait(mut tick) => {
                    if !delayed {
                        trace!(endpoint, "rate ceiling reached, waiting for next window");
                    }
                    delayed = true;
                    // The sender lives in the endpoint map for the scheduler's
                    // lifetime, so this only errors during teardown.
                    let _ = tick.changed().await;
                }
            }
        }
    }

    /// Take a concurrency slot, then wait for rate clearance.
    pub async fn acquire(&self, endpoint: &str) -> Result<SchedulerPermit> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Runtime("request scheduler closed".to_string()))?;
        self.schedule(endpoint).await;
        Ok(SchedulerPermit { _permit: permit })
    }

    /// Close `endpoint` for a full window from now and wait for the tick
    /// that reopens it. Call after the registry answers 429.
    pub async fn penalize(&self, endpoint: &str) {
        let mut tick = {
            let mut endpoints = self.inner.endpoints();
            let now = Instant::now();
            let state = endpoints
                .entry(endpoint.to_string())
                .or_insert_with(|| EndpointState::new(now));
            state.window_start = now;
            state.count = state.count.max(self.inner.queries_per_second);
            state.release_at = now + WINDOW;
            state.stats.penalties += 1;
            let tick = state.tick.subscribe();
            self.arm_timer(endpoint, state);
            tick
        };
        debug!(endpoint, "rate limited by registry, backing off one window");
        let _ = tick.changed().await;
    }

    /// Counters for `endpoint` (zeroes if it was never used).
    #[must_use]
    pub fn stats(&self, endpoint: &str) -> EndpointStats {
        self.inner
            .endpoints()
            .get(endpoint)
            .map(|state| state.stats)
            .unwrap_or_default()
    }

    /// Concurrency slots currently free.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    #[must_use]
    pub fn queries_per_second(&self) -> u32 {
        self.inner.queries_per_second
    }

    fn try_clear(&self, endpoint: &str, delayed: bool) -> Clearance {
        let mut endpoints = self.inner.endpoints();
        let now = Instant::now();
        let state = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointState::new(now));
        state.roll(now);

        if state.count < self.inner.queries_per_second {
            state.count += 1;
            state.stats.issued += 1;
            if delayed {
                state.stats.delayed += 1;
            }
            return Clearance::Go;
        }

        let tick = state.tick.subscribe();
        self.arm_timer(endpoint, state);
        Clearance::Wait(tick)
    }

    /// Spawn the single tick task for the current window if none is pending.
    fn arm_timer(&self, endpoint: &str, state: &mut EndpointState) {
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        state.release_at = state.release_at.max(state.window_start + WINDOW);
        let mut deadline = state.release_at;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep_until(deadline).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut endpoints = inner.endpoints();
                let Some(state) = endpoints.get_mut(&endpoint) else {
                    return;
                };
                if state.release_at > deadline {
                    // Penalized while we slept.
                    deadline = state.release_at;
                    continue;
                }
                state.window_start = Instant::now();
                state.count = 0;
                state.timer_armed = false;
                state.tick.send_modify(|epoch| *epoch += 1);
                return;
            }
        });
    }
}
