//! Live tail of the change feed after catch-up.
//!
//! Repeatedly requests `_changes?since=<mark>` without a limit, emits every
//! batch, and raises the persisted mark to the batch's last sequence. Any
//! transient condition (stream end, 404, network error) waits and reconnects.
//! Only persistence failures and cancellation end the loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catchup::emit_records;
use crate::changes::ChangeStream;
use crate::error::{FetchError, Result};
use crate::events::EventBus;
use crate::registry::{ChangesResponse, ENDPOINT_CHANGES, RegistryClient};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::scheduler::RateScheduler;
use crate::shutdown::Shutdown;
use crate::store::ProgressStore;

/// Follows the feed from a starting sequence until shutdown.
pub struct LiveTail {
    client: Arc<dyn RegistryClient>,
    scheduler: RateScheduler,
    store: ProgressStore,
    events: EventBus,
    tail_delay: Duration,
    shutdown: Shutdown,
}

enum Poll {
    /// Body ended; `progressed` if the mark moved.
    Ended { progressed: bool },
    Failed(FetchError),
    Cancelled,
}

impl LiveTail {
    #[must_use]
    pub fn new(
        client: Arc<dyn RegistryClient>,
        scheduler: RateScheduler,
        store: ProgressStore,
        events: EventBus,
        tail_delay: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            client,
            scheduler,
            store,
            events,
            tail_delay,
            shutdown,
        }
    }

    /// Run until shutdown. Returns the final mark.
    pub async fn run(&self, from: u64) -> Result<u64> {
        let mut mark = from;
        let mut backoff = RetryBudget::new(RetryPolicy::live_tail(self.tail_delay));
        info!(from, "live tail started");

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let delay = match self.poll(&mut mark).await? {
                Poll::Cancelled => break,
                Poll::Ended { progressed: true } => {
                    backoff.refill();
                    continue;
                }
                Poll::Ended { progressed: false } => {
                    backoff.refill();
                    self.tail_delay
                }
                Poll::Failed(FetchError::RateLimited) => {
                    self.scheduler.penalize(ENDPOINT_CHANGES).await;
                    continue;
                }
                Poll::Failed(err) => {
                    let delay = backoff.charge().unwrap_or(self.tail_delay);
                    warn!(
                        mark,
                        error = %err,
                        attempt = backoff.consecutive_failures(),
                        "live tail request failed, reconnecting"
                    );
                    delay
                }
            };
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                () = shutdown.wait() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(mark, "live tail stopped");
        Ok(mark)
    }

    async fn poll(&self, mark: &mut u64) -> Result<Poll> {
        let since = *mark;
        let permit = self.scheduler.acquire(ENDPOINT_CHANGES).await?;
        let mut shutdown = self.shutdown.clone();
        let response = tokio::select! {
            () = shutdown.wait() => return Ok(Poll::Cancelled),
            response = self.client.changes(since, None) => response,
        };
        let body = match response {
            Ok(ChangesResponse::Stream(body)) => body,
            Ok(ChangesResponse::Exhausted) => return Ok(Poll::Ended { progressed: false }),
            Err(err) => return Ok(Poll::Failed(err)),
        };

        let mut stream = ChangeStream::new(body, self.shutdown.clone());
        let outcome = loop {
            match stream.next_batch().await {
                Ok(Some(batch)) => {
                    let Some(last_seq) = batch.last_seq else {
                        continue;
                    };
                    let fresh: Vec<_> = batch
                        .records
                        .into_iter()
                        .filter(|r| r.sequence > *mark)
                        .collect();
                    if !fresh.is_empty() {
                        emit_records(&self.events, &self.store, fresh).await?;
                    }
                    *mark = self.store.advance_low_water_mark(last_seq).await?;
                    debug!(low_water_mark = *mark, "live tail checkpoint");
                }
                Ok(None) if self.shutdown.is_triggered() => break Poll::Cancelled,
                Ok(None) => {
                    break Poll::Ended {
                        progressed: *mark > since,
                    };
                }
                Err(err) if *mark > since => {
                    debug!(error = %err, "live tail stream broke after progress");
                    break Poll::Ended { progressed: true };
                }
                Err(err) => break Poll::Failed(err),
            }
        };
        drop(permit);
        Ok(outcome)
    }
}
