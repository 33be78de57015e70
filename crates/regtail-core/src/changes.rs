//! Change-feed decoding.
//!
//! The registry's `_changes` endpoint answers with one record per line, wrapped
//! in a JSON envelope:
//!
//! ```text
//! {"results":[
//! {"seq":1,"id":"koishi-plugin-foo","changes":[{"rev":"1-abc"}]},
//! {"seq":2,"id":"left-pad","changes":[{"rev":"7-def"}],"deleted":true}
//! ],
//! "last_seq":2,"pending":0}
//! ```
//!
//! [`ChangeDecoder`] turns arbitrary network chunks into record batches. Lines
//! may be split anywhere (including inside a UTF-8 sequence), so the decoder
//! works on bytes and carries the unterminated tail into the next chunk.
//! Envelope lines and garbage fail to parse and are dropped.
//!
//! [`ChangeStream`] drives a decoder over a response body and honours
//! cancellation between reads.

use std::future::Future;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::FetchError;
use crate::shutdown::Shutdown;

/// A response body as a stream of chunks.
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, FetchError>>;

/// One revision reference inside a change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub rev: String,
}

/// One entry of the remote change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(rename = "id")]
    pub package_id: String,
    #[serde(rename = "changes", default)]
    pub revisions: Vec<Revision>,
    #[serde(default)]
    pub deleted: bool,
}

/// Records decoded from one underlying read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    /// Highest sequence in `records`; the checkpoint for this batch.
    pub last_seq: Option<u64>,
}

impl ChangeBatch {
    fn from_records(records: Vec<ChangeRecord>) -> Self {
        let last_seq = records.iter().map(|r| r.sequence).max();
        Self { records, last_seq }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Incremental line decoder for change-feed bodies.
#[derive(Debug, Default)]
pub struct ChangeDecoder {
    pending: Vec<u8>,
    dropped_lines: u64,
    decoded: u64,
}

impl ChangeDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every complete line available after appending `chunk`.
    pub fn push(&mut self, chunk: &[u8]) -> ChangeBatch {
        let mut records = Vec::new();
        let mut start = 0;

        if self.pending.is_empty() {
            // Fast path: decode straight out of the chunk.
            for end in memchr::memchr_iter(b'\n', chunk) {
                self.decode_line(&chunk[start..end], &mut records);
                start = end + 1;
            }
            self.pending.extend_from_slice(&chunk[start..]);
        } else {
            self.pending.extend_from_slice(chunk);
            let buffered = std::mem::take(&mut self.pending);
            for end in memchr::memchr_iter(b'\n', &buffered) {
                self.decode_line(&buffered[start..end], &mut records);
                start = end + 1;
            }
            self.pending.extend_from_slice(&buffered[start..]);
        }

        ChangeBatch::from_records(records)
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> ChangeBatch {
        let mut records = Vec::new();
        let tail = std::mem::take(&mut self.pending);
        self.decode_line(&tail, &mut records);
        ChangeBatch::from_records(records)
    }

    /// Lines that were not change records (envelope lines included).
    #[must_use]
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    /// Records decoded so far.
    #[must_use]
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Bytes held back waiting for a line terminator.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<ChangeRecord>) {
        let line = trim_record_line(line);
        if line.is_empty() {
            return;
        }
        match serde_json::from_slice::<ChangeRecord>(line) {
            Ok(record) => {
                self.decoded += 1;
                out.push(record);
            }
            Err(err) => {
                self.dropped_lines += 1;
                trace!(error = %err, len = line.len(), "dropping non-record line");
            }
        }
    }
}

/// Strip surrounding whitespace and one list-separator comma.
fn trim_record_line(line: &[u8]) -> &[u8] {
    let line = line.trim_ascii();
    let line = line.strip_suffix(b",").unwrap_or(line);
    line.trim_ascii_end()
}

/// Decode a complete body in one go.
#[must_use]
pub fn decode_all(body: &[u8]) -> Vec<ChangeRecord> {
    let mut decoder = ChangeDecoder::new();
    let mut records = decoder.push(body).records;
    records.extend(decoder.finish().records);
    records
}

/// Pulls [`ChangeBatch`]es out of a response body.
pub struct ChangeStream {
    body: Option<ByteStream>,
    decoder: ChangeDecoder,
    shutdown: Shutdown,
    records: u64,
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("open", &self.body.is_some())
            .field("records", &self.records)
            .field("dropped_lines", &self.decoder.dropped_lines())
            .finish()
    }
}

impl ChangeStream {
    #[must_use]
    pub fn new(body: ByteStream, shutdown: Shutdown) -> Self {
        Self {
            body: Some(body),
            decoder: ChangeDecoder::new(),
            shutdown,
            records: 0,
        }
    }

    /// Next non-empty batch, or `Ok(None)` once the body ends or shutdown is
    /// raised. The body is dropped as soon as either happens.
    pub async fn next_batch(&mut self) -> std::result::Result<Option<ChangeBatch>, FetchError> {
        loop {
            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            if self.shutdown.is_triggered() {
                self.body = None;
                return Ok(None);
            }

            let mut shutdown = self.shutdown.clone();
            let chunk = tokio::select! {
                biased;
                () = shutdown.wait() => None,
                chunk = body.next() => Some(chunk),
            };
            let Some(chunk) = chunk else {
                self.body = None;
                return Ok(None);
            };

            let batch = match chunk {
                Some(Ok(bytes)) => self.decoder.push(&bytes),
                Some(Err(err)) => {
                    self.body = None;
                    return Err(err);
                }
                None => {
                    self.body = None;
                    self.decoder.finish()
                }
            };

            if !batch.is_empty() {
                self.records += batch.len() as u64;
                return Ok(Some(batch));
            }
        }
    }

    /// Drive the stream to its end, handing every batch to `on_batch`.
    /// Stops early if the callback fails.
    pub async fn for_each_batch<F, Fut, E>(&mut self, mut on_batch: F) -> std::result::Result<u64, E>
    where
        F: FnMut(ChangeBatch) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: From<FetchError>,
    {
        while let Some(batch) = self.next_batch().await? {
            on_batch(batch).await?;
        }
        Ok(self.records)
    }

    /// Records yielded so far.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    #[must_use]
    pub fn dropped_lines(&self) -> u64 {
        self.decoder.dropped_lines()
    }
}
