//! Block catch-up coordinator.
//!
//! Drains the backlog `[local, target)` with a pool of workers. The backlog is
//! cut into blocks (see [`crate::blocks`]); workers pop blocks from a shared
//! queue and stream each one from the registry with `since = progress_seq`
//! and `limit = range_end - progress_seq`. Every decoded batch is published,
//! filtered, and checkpointed through the [`ProgressStore`], which advances
//! the low-water-mark as blocks finish.
//!
//! A block fetched with `since = begin` covers sequences `(begin, end]`.
//! Records above `range_end` in a batch belong to the next block and are
//! not emitted, but their presence still proves the block is finished.
//!
//! Only a 404 finishes a block without records. A 200 whose body ends before
//! the block is done counts as a failed attempt against the retry budget.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::blocks::{self, Block, CompletionBoundary};
use crate::changes::{ChangeBatch, ChangeRecord, ChangeStream};
use crate::error::{Error, FetchError, Result};
use crate::events::{EventBus, SyncEvent};
use crate::filter;
use crate::registry::{ChangesResponse, ENDPOINT_CHANGES, RegistryClient};
use crate::retry::{RetryBudget, RetryPolicy, is_retryable_fetch};
use crate::scheduler::RateScheduler;
use crate::shutdown::Shutdown;
use crate::store::ProgressStore;

/// Tuning for a catch-up run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpConfig {
    pub block_size: u64,
    pub concurrency: usize,
    /// Consecutive attempts without progress a block may fail before the
    /// run is aborted.
    pub max_retries: u32,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            block_size: 10_000,
            concurrency: 8,
            max_retries: 5,
        }
    }
}

/// Totals for a catch-up run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatchUpSummary {
    /// Blocks in the plan.
    pub blocks: usize,
    /// Records emitted.
    pub records: u64,
    /// Relevant records emitted.
    pub relevant: u64,
    pub low_water_mark: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// Every block finished. The mark equals the target, or sits one below
    /// it when the last block finished early under the minus-one boundary.
    Completed(CatchUpSummary),
    /// Shutdown was raised. Persisted progress is intact.
    Interrupted(CatchUpSummary),
}

/// Block list to execute for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub blocks: Vec<Block>,
    /// The persisted list was unusable and was replaced.
    pub discarded: bool,
}

/// Build the block list for `[local, target)`, reusing `existing` when it
/// still describes the backlog behind `local`.
#[must_use]
pub fn plan(
    existing: Vec<Block>,
    local: u64,
    target: u64,
    block_size: u64,
    boundary: CompletionBoundary,
) -> Plan {
    let (mut blocks, discarded) = if existing.is_empty() {
        (blocks::partition(local, target, block_size), false)
    } else if let Err(reason) = consistent(&existing, local) {
        warn!(local, %reason, "discarding persisted catch-up blocks");
        (blocks::partition(local, target, block_size), true)
    } else {
        (blocks::extend(existing, local, target, block_size), false)
    };
    blocks::prime(&mut blocks, local, boundary);
    Plan { blocks, discarded }
}

fn consistent(existing: &[Block], local: u64) -> std::result::Result<(), String> {
    blocks::validate(existing).map_err(|e| e.to_string())?;
    let first_begin = existing.first().map_or(local, |b| b.range_begin);
    if first_begin > local {
        return Err(format!("blocks start at {first_begin}, above the mark"));
    }
    let frontier = existing
        .iter()
        .find(|b| !b.done)
        .or(existing.last())
        .map_or(local, |b| if b.done { b.range_end } else { b.range_begin });
    if local > frontier {
        return Err(format!("mark {local} is past unfinished block at {frontier}"));
    }
    Ok(())
}

struct Context {
    client: Arc<dyn RegistryClient>,
    scheduler: RateScheduler,
    store: ProgressStore,
    events: EventBus,
    policy: RetryPolicy,
    shutdown: Shutdown,
    queue: Mutex<VecDeque<Block>>,
}

impl Context {
    fn next_block(&self) -> Option<Block> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Records emitted and how many of them were relevant.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RecordCounts {
    records: u64,
    relevant: u64,
}

impl RecordCounts {
    fn add(&mut self, other: Self) {
        self.records += other.records;
        self.relevant += other.relevant;
    }
}

/// Concurrent catch-up over a [`RegistryClient`].
pub struct CatchUp {
    client: Arc<dyn RegistryClient>,
    scheduler: RateScheduler,
    store: ProgressStore,
    events: EventBus,
    config: CatchUpConfig,
    shutdown: Shutdown,
}

impl CatchUp {
    #[must_use]
    pub fn new(
        client: Arc<dyn RegistryClient>,
        scheduler: RateScheduler,
        store: ProgressStore,
        events: EventBus,
        config: CatchUpConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            client,
            scheduler,
            store,
            events,
            config,
            shutdown,
        }
    }

    /// Bring the persisted mark from `local` up to `target`.
    pub async fn run(&self, local: u64, target: u64) -> Result<CatchUpOutcome> {
        let state = self.store.load().await?;
        let plan = plan(
            state.blocks.clone(),
            local,
            target,
            self.config.block_size,
            self.store.boundary(),
        );
        if plan.blocks != state.blocks {
            self.store.replace_blocks(plan.blocks.clone()).await?;
        }

        let pending: VecDeque<Block> = plan.blocks.iter().filter(|b| !b.done).copied().collect();
        let mut summary = CatchUpSummary {
            blocks: plan.blocks.len(),
            low_water_mark: state.low_water_mark,
            ..CatchUpSummary::default()
        };
        info!(
            local,
            target,
            blocks = plan.blocks.len(),
            pending = pending.len(),
            discarded = plan.discarded,
            "catch-up planned"
        );

        if !pending.is_empty() {
            let workers = self.config.concurrency.clamp(1, pending.len());
            let ctx = Arc::new(Context {
                client: Arc::clone(&self.client),
                scheduler: self.scheduler.clone(),
                store: self.store.clone(),
                events: self.events.clone(),
                policy: RetryPolicy::block_fetch(self.config.max_retries),
                shutdown: self.shutdown.clone(),
                queue: Mutex::new(pending),
            });
            let totals = run_workers(&ctx, workers).await?;
            summary.records = totals.records;
            summary.relevant = totals.relevant;
        }

        let snapshot = self.store.snapshot().await?;
        summary.low_water_mark = snapshot.low_water_mark;
        if self.shutdown.is_triggered() || snapshot.blocks_pending > 0 {
            info!(
                low_water_mark = snapshot.low_water_mark,
                pending = snapshot.blocks_pending,
                "catch-up interrupted"
            );
            return Ok(CatchUpOutcome::Interrupted(summary));
        }

        // The done prefix already moved the mark as far as it is confirmed.
        self.store.clear_blocks().await?;
        info!(
            low_water_mark = summary.low_water_mark,
            target,
            records = summary.records,
            relevant = summary.relevant,
            "catch-up complete"
        );
        Ok(CatchUpOutcome::Completed(summary))
    }
}

async fn run_workers(ctx: &Arc<Context>, workers: usize) -> Result<RecordCounts> {
    let mut set = JoinSet::new();
    for worker in 0..workers {
        let ctx = Arc::clone(ctx);
        set.spawn(async move { worker_loop(worker, &ctx).await });
    }

    let mut totals = RecordCounts::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(counts)) => totals.add(counts),
            Ok(Err(err)) => {
                warn!(error = %err, "catch-up worker failed, stopping remaining workers");
                set.abort_all();
                while set.join_next().await.is_some() {}
                return Err(err);
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                set.abort_all();
                while set.join_next().await.is_some() {}
                return Err(Error::Runtime(format!("catch-up worker panicked: {join_err}")));
            }
        }
    }
    Ok(totals)
}

async fn worker_loop(worker: usize, ctx: &Context) -> Result<RecordCounts> {
    let mut totals = RecordCounts::default();
    while !ctx.shutdown.is_triggered() {
        let Some(block) = ctx.next_block() else {
            break;
        };
        debug!(worker, block_id = block.id, "block started");
        totals.add(fetch_block(ctx, block).await?);
    }
    Ok(totals)
}

enum Attempt {
    /// The block is done.
    Finished,
    /// Stream ended before the block finished.
    Partial { progressed: bool, error: Option<FetchError> },
    Cancelled,
}

async fn fetch_block(ctx: &Context, mut block: Block) -> Result<RecordCounts> {
    let mut totals = RecordCounts::default();
    let mut budget = RetryBudget::new(ctx.policy.clone());

    loop {
        if ctx.shutdown.is_triggered() {
            return Ok(totals);
        }
        let attempt = attempt_block(ctx, &mut block, &mut totals).await?;
        let error = match attempt {
            Attempt::Finished | Attempt::Cancelled => return Ok(totals),
            Attempt::Partial {
                progressed: true,
                error,
            } => {
                budget.refill();
                if let Some(err) = &error {
                    debug!(
                        block_id = block.id,
                        progress_seq = block.progress_seq,
                        error = %err,
                        "block stream broke after progress, resuming"
                    );
                }
                continue;
            }
            Attempt::Partial {
                progressed: false,
                error,
            } => error.unwrap_or_else(|| {
                FetchError::Transport(format!(
                    "body ended before block reached {}",
                    block.range_end
                ))
            }),
        };

        if error == FetchError::RateLimited {
            ctx.scheduler.penalize(ENDPOINT_CHANGES).await;
            continue;
        }
        if !is_retryable_fetch(&error) {
            return Err(Error::Fetch(error));
        }
        let Some(delay) = budget.charge() else {
            return Err(Error::RetriesExhausted {
                operation: format!("block {} [{}, {})", block.id, block.range_begin, block.range_end),
                attempts: budget.consecutive_failures(),
                last_error: error.to_string(),
            });
        };
        debug!(
            block_id = block.id,
            attempt = budget.consecutive_failures(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "block fetch failed, backing off"
        );
        let mut shutdown = ctx.shutdown.clone();
        tokio::select! {
            () = shutdown.wait() => return Ok(totals),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn attempt_block(
    ctx: &Context,
    block: &mut Block,
    totals: &mut RecordCounts,
) -> Result<Attempt> {
    let since = block.progress_seq;
    let permit = ctx.scheduler.acquire(ENDPOINT_CHANGES).await?;
    let mut shutdown = ctx.shutdown.clone();
    let response = tokio::select! {
        () = shutdown.wait() => return Ok(Attempt::Cancelled),
        response = ctx.client.changes(since, Some(block.remaining())) => response,
    };

    let body = match response {
        Ok(ChangesResponse::Stream(body)) => body,
        Ok(ChangesResponse::Exhausted) => {
            drop(permit);
            let update = ctx.store.complete_block(block.id).await?;
            *block = update.block;
            log_completion(block, update.low_water_mark);
            return Ok(Attempt::Finished);
        }
        Err(err) => {
            return Ok(Attempt::Partial {
                progressed: false,
                error: Some(err),
            });
        }
    };

    let mut stream = ChangeStream::new(body, ctx.shutdown.clone());
    let mut error = None;
    loop {
        match stream.next_batch().await {
            Ok(Some(batch)) => {
                if process_batch(ctx, block, batch, totals).await? {
                    return Ok(Attempt::Finished);
                }
            }
            Ok(None) => break,
            Err(err) => {
                error = Some(err);
                break;
            }
        }
    }
    drop(permit);

    if ctx.shutdown.is_triggered() {
        return Ok(Attempt::Cancelled);
    }
    Ok(Attempt::Partial {
        progressed: block.progress_seq > since,
        error,
    })
}

/// Emit and checkpoint one batch. Returns true once the block is done.
async fn process_batch(
    ctx: &Context,
    block: &mut Block,
    batch: ChangeBatch,
    totals: &mut RecordCounts,
) -> Result<bool> {
    let Some(last_seq) = batch.last_seq else {
        return Ok(false);
    };
    let in_range: Vec<ChangeRecord> = batch
        .records
        .into_iter()
        .filter(|r| r.sequence > block.progress_seq && r.sequence <= block.range_end)
        .collect();

    if !in_range.is_empty() {
        totals.add(emit_records(&ctx.events, &ctx.store, in_range).await?);
    }

    let update = ctx.store.record_block_progress(block.id, last_seq).await?;
    *block = update.block;
    if update.completed {
        log_completion(block, update.low_water_mark);
    }
    Ok(block.done)
}

/// Publish a batch, filter it, and remember relevant packages. Shared with
/// the live tail.
pub(crate) async fn emit_records(
    events: &EventBus,
    store: &ProgressStore,
    records: Vec<ChangeRecord>,
) -> Result<RecordCounts> {
    let relevant: Vec<ChangeRecord> = records
        .iter()
        .filter(|r| filter::is_relevant(&r.package_id))
        .cloned()
        .collect();
    let counts = RecordCounts {
        records: records.len() as u64,
        relevant: relevant.len() as u64,
    };

    events.publish(SyncEvent::PackagesFetched {
        records: records.into(),
    });
    if relevant.is_empty() {
        return Ok(counts);
    }

    let added = store
        .upsert_packages(
            relevant
                .iter()
                .map(|r| (r.package_id.clone(), r.sequence))
                .collect(),
        )
        .await?;
    for record in &relevant {
        debug!(
            package = %record.package_id,
            seq = record.sequence,
            first_party = filter::is_first_party(&record.package_id),
            deleted = record.deleted,
            "relevant package"
        );
    }
    if added > 0 {
        info!(added, "new plugin packages discovered");
    }
    events.publish(SyncEvent::RelevantPackagesFetched {
        records: relevant.into(),
    });
    Ok(counts)
}

fn log_completion(block: &Block, low_water_mark: u64) {
    debug!(
        block_id = block.id,
        range_end = block.range_end,
        low_water_mark,
        "block complete"
    );
}
