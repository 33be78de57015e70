//! Durable synchronization progress.
//!
//! A [`ProgressStore`] owns a [`KvBackend`] on a dedicated writer thread.
//! Every mutation is a command applied to a scratch copy of the in-memory
//! state, persisted, and only then committed, so a failed write leaves both
//! the backend and memory at their previous values. Commands are handled one
//! at a time, which makes "update block, recompute low-water-mark" a single
//! atomic step no matter how many workers report concurrently.

mod backend;
mod sqlite;

use std::collections::BTreeMap;
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub use backend::{KEY_BLOCKS, KEY_KNOWN_PACKAGES, KEY_LOW_WATER_MARK, KvBackend, MemoryBackend};
pub use sqlite::SqliteBackend;

use crate::blocks::{self, Block, CompletionBoundary};
use crate::error::{Error, Result, StorageError};

const COMMAND_QUEUE: usize = 256;

/// Everything the synchronizer persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Every feed entry with a sequence at or below this value has been
    /// processed.
    pub low_water_mark: u64,
    /// Relevant package id to the sequence at which it was last seen.
    pub known_packages: BTreeMap<String, u64>,
    /// Catch-up plan; empty when no catch-up is in progress.
    pub blocks: Vec<Block>,
}

/// Summary of [`ProgressState`] for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub low_water_mark: u64,
    pub known_packages: usize,
    pub blocks_total: usize,
    pub blocks_pending: usize,
}

impl From<&ProgressState> for ProgressSnapshot {
    fn from(state: &ProgressState) -> Self {
        Self {
            low_water_mark: state.low_water_mark,
            known_packages: state.known_packages.len(),
            blocks_total: state.blocks.len(),
            blocks_pending: blocks::pending(&state.blocks),
        }
    }
}

/// Result of applying progress to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockUpdate {
    pub block: Block,
    /// This update finished the block.
    pub completed: bool,
    /// Low-water-mark after the update.
    pub low_water_mark: u64,
    /// This update moved the low-water-mark.
    pub advanced: bool,
}

type Reply<T> = oneshot::Sender<std::result::Result<T, StorageError>>;

enum StoreCommand {
    Load(oneshot::Sender<ProgressState>),
    Snapshot(oneshot::Sender<ProgressSnapshot>),
    AdvanceLowWaterMark(u64, Reply<u64>),
    ReplaceBlocks(Vec<Block>, Reply<()>),
    RecordProgress { id: u32, seq: u64, reply: Reply<BlockUpdate> },
    CompleteBlock { id: u32, reply: Reply<BlockUpdate> },
    UpsertPackages(Vec<(String, u64)>, Reply<usize>),
}

/// Handle to the progress writer. Cheap to clone; the writer thread exits
/// once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    tx: mpsc::Sender<StoreCommand>,
    boundary: CompletionBoundary,
}

impl std::fmt::Debug for StoreCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Load(_) => "Load",
            Self::Snapshot(_) => "Snapshot",
            Self::AdvanceLowWaterMark(..) => "AdvanceLowWaterMark",
            Self::ReplaceBlocks(..) => "ReplaceBlocks",
            Self::RecordProgress { .. } => "RecordProgress",
            Self::CompleteBlock { .. } => "CompleteBlock",
            Self::UpsertPackages(..) => "UpsertPackages",
        };
        f.write_str(name)
    }
}

impl ProgressStore {
    /// Load persisted state from `backend` and start the writer thread.
    /// Fails if the persisted state is unreadable.
    pub fn open<B: KvBackend>(backend: B, boundary: CompletionBoundary) -> Result<Self> {
        let state = load_state(&backend)?;
        debug!(
            low_water_mark = state.low_water_mark,
            known_packages = state.known_packages.len(),
            blocks = state.blocks.len(),
            "progress loaded"
        );
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        thread::Builder::new()
            .name("regtail-store".to_string())
            .spawn(move || {
                Writer {
                    backend,
                    state,
                    boundary,
                }
                .run(rx);
            })?;
        Ok(Self { tx, boundary })
    }

    /// Store over a fresh in-memory backend.
    pub fn in_memory(boundary: CompletionBoundary) -> Result<Self> {
        Self::open(MemoryBackend::new(), boundary)
    }

    /// Completion boundary the writer applies to block progress.
    #[must_use]
    pub fn boundary(&self) -> CompletionBoundary {
        self.boundary
    }

    /// Full copy of the current state.
    pub async fn load(&self) -> Result<ProgressState> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Load(reply)).await?;
        rx.await.map_err(|_| Error::Storage(StorageError::Closed))
    }

    pub async fn snapshot(&self) -> Result<ProgressSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| Error::Storage(StorageError::Closed))
    }

    pub async fn low_water_mark(&self) -> Result<u64> {
        Ok(self.snapshot().await?.low_water_mark)
    }

    /// Raise the low-water-mark to `seq` if it is higher. Returns the mark
    /// after the call.
    pub async fn advance_low_water_mark(&self, seq: u64) -> Result<u64> {
        self.request(|reply| StoreCommand::AdvanceLowWaterMark(seq, reply))
            .await
    }

    /// Persist a new catch-up plan. An empty list clears the plan.
    pub async fn replace_blocks(&self, blocks: Vec<Block>) -> Result<()> {
        self.request(|reply| StoreCommand::ReplaceBlocks(blocks, reply))
            .await
    }

    pub async fn clear_blocks(&self) -> Result<()> {
        self.replace_blocks(Vec::new()).await
    }

    /// Record that block `id` has been fetched through `seq`. If that
    /// completes the block, the low-water-mark advances to the confirmed end
    /// of the done prefix in the same step.
    pub async fn record_block_progress(&self, id: u32, seq: u64) -> Result<BlockUpdate> {
        self.request(|reply| StoreCommand::RecordProgress { id, seq, reply })
            .await
    }

    /// Mark block `id` finished regardless of its progress.
    pub async fn complete_block(&self, id: u32) -> Result<BlockUpdate> {
        self.request(|reply| StoreCommand::CompleteBlock { id, reply })
            .await
    }

    /// Remember relevant packages. A package's sequence never moves
    /// backwards. Returns how many ids were not known before.
    pub async fn upsert_packages(&self, packages: Vec<(String, u64)>) -> Result<usize> {
        if packages.is_empty() {
            return Ok(0);
        }
        self.request(|reply| StoreCommand::UpsertPackages(packages, reply))
            .await
    }

    pub async fn known_packages(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self.load().await?.known_packages)
    }

    async fn send(&self, command: StoreCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Storage(StorageError::Closed))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> StoreCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        let outcome = rx.await.map_err(|_| StorageError::Closed)?;
        Ok(outcome?)
    }
}

struct Writer<B> {
    backend: B,
    state: ProgressState,
    boundary: CompletionBoundary,
}

impl<B: KvBackend> Writer<B> {
    fn run(mut self, mut rx: mpsc::Receiver<StoreCommand>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                StoreCommand::Load(reply) => {
                    let _ = reply.send(self.state.clone());
                }
                StoreCommand::Snapshot(reply) => {
                    let _ = reply.send(ProgressSnapshot::from(&self.state));
                }
                StoreCommand::AdvanceLowWaterMark(seq, reply) => {
                    let _ = reply.send(self.advance_low_water_mark(seq));
                }
                StoreCommand::ReplaceBlocks(blocks, reply) => {
                    let _ = reply.send(self.replace_blocks(blocks));
                }
                StoreCommand::RecordProgress { id, seq, reply } => {
                    let _ = reply.send(self.update_block(id, |block, boundary| {
                        block.advance(seq, boundary)
                    }));
                }
                StoreCommand::CompleteBlock { id, reply } => {
                    let _ = reply.send(self.update_block(id, |block, _| {
                        let was_done = block.done;
                        block.complete();
                        !was_done
                    }));
                }
                StoreCommand::UpsertPackages(packages, reply) => {
                    let _ = reply.send(self.upsert_packages(packages));
                }
            }
        }
        debug!("progress writer stopped");
    }

    fn advance_low_water_mark(&mut self, seq: u64) -> std::result::Result<u64, StorageError> {
        if seq <= self.state.low_water_mark {
            return Ok(self.state.low_water_mark);
        }
        self.backend.set(KEY_LOW_WATER_MARK, &Value::from(seq))?;
        self.state.low_water_mark = seq;
        Ok(seq)
    }

    fn replace_blocks(&mut self, blocks: Vec<Block>) -> std::result::Result<(), StorageError> {
        blocks::validate(&blocks)?;
        self.backend.set(KEY_BLOCKS, &encode(KEY_BLOCKS, &blocks)?)?;
        self.state.blocks = blocks;
        Ok(())
    }

    fn update_block(
        &mut self,
        id: u32,
        apply: impl FnOnce(&mut Block, CompletionBoundary) -> bool,
    ) -> std::result::Result<BlockUpdate, StorageError> {
        let index = self
            .state
            .blocks
            .iter()
            .position(|block| block.id == id)
            .ok_or(StorageError::UnknownBlock(id))?;

        let mut scratch = self.state.blocks.clone();
        let before = scratch[index];
        let completed = apply(&mut scratch[index], self.boundary);
        let block = scratch[index];

        let mut low_water_mark = self.state.low_water_mark;
        if completed {
            if let Some(end) = blocks::done_prefix_end(&scratch) {
                low_water_mark = low_water_mark.max(end);
            }
        }
        let advanced = low_water_mark != self.state.low_water_mark;

        if block != before {
            let mut entries = vec![(KEY_BLOCKS, encode(KEY_BLOCKS, &scratch)?)];
            if advanced {
                entries.push((KEY_LOW_WATER_MARK, Value::from(low_water_mark)));
            }
            self.backend.set_many(&entries)?;
            self.state.blocks = scratch;
            self.state.low_water_mark = low_water_mark;
        }

        Ok(BlockUpdate {
            block,
            completed,
            low_water_mark,
            advanced,
        })
    }

    fn upsert_packages(
        &mut self,
        packages: Vec<(String, u64)>,
    ) -> std::result::Result<usize, StorageError> {
        let mut scratch = self.state.known_packages.clone();
        let mut added = 0;
        let mut changed = false;
        for (id, seq) in packages {
            match scratch.get_mut(&id) {
                Some(known) if *known >= seq => {}
                Some(known) => {
                    *known = seq;
                    changed = true;
                }
                None => {
                    scratch.insert(id, seq);
                    added += 1;
                    changed = true;
                }
            }
        }
        if changed {
            self.backend
                .set(KEY_KNOWN_PACKAGES, &encode(KEY_KNOWN_PACKAGES, &scratch)?)?;
            self.state.known_packages = scratch;
        }
        Ok(added)
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> std::result::Result<Value, StorageError> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        details: e.to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(
    key: &str,
    value: Value,
) -> std::result::Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        details: e.to_string(),
    })
}

/// Read persisted state. Missing keys take their defaults; a low-water-mark
/// stored as a numeric string is accepted.
fn load_state<B: KvBackend>(backend: &B) -> std::result::Result<ProgressState, StorageError> {
    let low_water_mark = match backend.get(KEY_LOW_WATER_MARK)? {
        None | Some(Value::Null) => 0,
        Some(Value::String(text)) => text.trim().parse().map_err(|_| StorageError::Corrupt {
            key: KEY_LOW_WATER_MARK.to_string(),
            details: format!("not a sequence: {text:?}"),
        })?,
        Some(value) => decode(KEY_LOW_WATER_MARK, value)?,
    };
    let known_packages = match backend.get(KEY_KNOWN_PACKAGES)? {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(value) => decode(KEY_KNOWN_PACKAGES, value)?,
    };
    let blocks: Vec<Block> = match backend.get(KEY_BLOCKS)? {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => decode(KEY_BLOCKS, value)?,
    };
    blocks::validate(&blocks)?;
    if let Some(first) = blocks.first() {
        if first.range_begin > low_water_mark {
            warn!(
                low_water_mark,
                first_block = first.range_begin,
                "persisted blocks start above the low-water-mark"
            );
        }
    }
    Ok(ProgressState {
        low_water_mark,
        known_packages,
        blocks,
    })
}
