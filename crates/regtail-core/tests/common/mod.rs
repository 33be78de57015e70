//! Shared test infrastructure for regtail-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::MockRegistry;
//! ```

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;

use regtail_core::catchup::CatchUpConfig;
use regtail_core::changes::ChangeRecord;
use regtail_core::changes::Revision;
use regtail_core::error::FetchError;
use regtail_core::registry::{ChangesResponse, RegistryClient};
use regtail_core::synchronizer::SyncConfig;

/// Scripted misbehaviour for one `_changes` request.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the request outright.
    Error(FetchError),
    /// Answer 404.
    Exhausted,
    /// Stream this many records, then break the body with a transport error.
    BreakAfter(usize),
    /// Answer 200 with a complete envelope and no records.
    EmptyBody,
}

#[derive(Debug, Default)]
struct State {
    update_seq: u64,
    records: Vec<ChangeRecord>,
    faults: Vec<(Option<u64>, Fault)>,
    probe_faults: Vec<FetchError>,
    requests: Vec<(u64, Option<u64>)>,
    probes: u32,
}

/// In-process registry serving a CouchDB-style `_changes` feed.
#[derive(Debug, Clone)]
pub struct MockRegistry {
    state: Arc<Mutex<State>>,
    chunk_size: usize,
}

/// Package id for sequence `seq`: every seventh is a plugin, every
/// eleventh a first-party plugin.
pub fn package_id(seq: u64) -> String {
    if seq % 11 == 0 {
        format!("@koishijs/plugin-gen-{seq}")
    } else if seq % 7 == 0 {
        format!("koishi-plugin-gen-{seq}")
    } else {
        format!("pkg-{seq}")
    }
}

pub fn record(seq: u64) -> ChangeRecord {
    ChangeRecord {
        sequence: seq,
        package_id: package_id(seq),
        revisions: vec![Revision {
            rev: format!("1-{seq:x}"),
        }],
        deleted: false,
    }
}

/// Plugin ids among `seqs`.
pub fn relevant_ids(seqs: impl IntoIterator<Item = u64>) -> BTreeSet<String> {
    seqs.into_iter()
        .map(package_id)
        .filter(|id| regtail_core::filter::is_relevant(id))
        .collect()
}

/// Render records the way the registry does.
pub fn render_body(records: &[ChangeRecord], last_seq: u64) -> String {
    let mut body = String::from("{\"results\":[\n");
    let lines: Vec<String> = records
        .iter()
        .map(|r| serde_json::to_string(r).expect("record serializes"))
        .collect();
    body.push_str(&lines.join(",\n"));
    if !lines.is_empty() {
        body.push('\n');
    }
    body.push_str(&format!("],\n\"last_seq\":{last_seq},\"pending\":0}}\n"));
    body
}

fn chunked(body: &[u8], chunk_size: usize) -> Vec<Result<Bytes, FetchError>> {
    body.chunks(chunk_size.max(1))
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect()
}

impl MockRegistry {
    /// Feed with one record per sequence in `1..=update_seq`.
    pub fn sequential(update_seq: u64) -> Self {
        Self::with_records(update_seq, (1..=update_seq).map(record).collect())
    }

    pub fn with_records(update_seq: u64, records: Vec<ChangeRecord>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                update_seq,
                records,
                ..State::default()
            })),
            chunk_size: 97,
        }
    }

    /// Split bodies into chunks of `chunk_size` bytes.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Misbehave on the next request with `since` (any request if `None`).
    pub fn inject(&self, since: Option<u64>, fault: Fault) {
        self.state.lock().unwrap().faults.push((since, fault));
    }

    /// Fail the next probe.
    pub fn inject_probe(&self, error: FetchError) {
        self.state.lock().unwrap().probe_faults.push(error);
    }

    /// Append records and raise `update_seq` to the last one.
    pub fn publish(&self, records: Vec<ChangeRecord>) {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = records.last() {
            state.update_seq = state.update_seq.max(last.sequence);
        }
        state.records.extend(records);
    }

    /// `(since, limit)` of every `_changes` request so far.
    pub fn requests(&self) -> Vec<(u64, Option<u64>)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn probes(&self) -> u32 {
        self.state.lock().unwrap().probes
    }

    pub fn arc(&self) -> Arc<dyn RegistryClient> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn update_seq(&self) -> Result<u64, FetchError> {
        let mut state = self.state.lock().unwrap();
        state.probes += 1;
        if !state.probe_faults.is_empty() {
            return Err(state.probe_faults.remove(0));
        }
        Ok(state.update_seq)
    }

    async fn changes(
        &self,
        since: u64,
        limit: Option<u64>,
    ) -> Result<ChangesResponse, FetchError> {
        let (records, fault) = {
            let mut state = self.state.lock().unwrap();
            state.requests.push((since, limit));
            let fault = state
                .faults
                .iter()
                .position(|(at, _)| at.is_none_or(|at| at == since))
                .map(|index| state.faults.remove(index).1);
            let take = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
            let records: Vec<ChangeRecord> = state
                .records
                .iter()
                .filter(|r| r.sequence > since)
                .take(take)
                .cloned()
                .collect();
            (records, fault)
        };

        match fault {
            Some(Fault::Error(err)) => Err(err),
            Some(Fault::Exhausted) => Ok(ChangesResponse::Exhausted),
            Some(Fault::BreakAfter(count)) => {
                let head = &records[..count.min(records.len())];
                // No envelope tail: the connection drops mid-body.
                let body = render_body(head, 0);
                let cut = body.rfind("],").unwrap_or(body.len());
                let mut chunks = chunked(&body.as_bytes()[..cut], self.chunk_size);
                chunks.push(Err(FetchError::Transport("connection reset".into())));
                Ok(ChangesResponse::Stream(stream::iter(chunks).boxed()))
            }
            Some(Fault::EmptyBody) => {
                let body = render_body(&[], since);
                let chunks = chunked(body.as_bytes(), self.chunk_size);
                Ok(ChangesResponse::Stream(stream::iter(chunks).boxed()))
            }
            None => {
                let last_seq = records.last().map_or(since, |r| r.sequence);
                let body = render_body(&records, last_seq);
                let chunks = chunked(body.as_bytes(), self.chunk_size);
                Ok(ChangesResponse::Stream(stream::iter(chunks).boxed()))
            }
        }
    }
}

/// Engine settings for fast tests.
pub fn sync_config(block_size: u64, concurrency: usize, max_retries: u32) -> SyncConfig {
    SyncConfig {
        catch_up: CatchUpConfig {
            block_size,
            concurrency,
            max_retries,
        },
        queries_per_second: 1_000,
        tail_delay: Duration::from_millis(20),
        event_capacity: 1 << 16,
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
