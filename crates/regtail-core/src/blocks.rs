//! Catch-up blocks and the low-water-mark rule.
//!
//! The backlog `[local, target)` is cut into contiguous blocks that are
//! fetched independently and finish in any order. The only sequence that is
//! safe to resume from is the confirmed progress at the end of the longest
//! run of finished blocks counted from the front; [`done_prefix_end`]
//! computes it.
//!
//! A block is fetched with `since = progress_seq`, so the records it
//! delivers carry sequences above its progress. A block is complete once its
//! progress reaches the [`CompletionBoundary`].
//!
//! Under [`CompletionBoundary::RangeEndMinusOne`] a block may finish one
//! short of `range_end`. Its successor then owns the record at that
//! sequence, so [`prime`] starts the successor's fetch at `range_begin - 1`.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A bounded, independently retryable unit of catch-up work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: u32,
    pub range_begin: u64,
    /// Exclusive.
    pub range_end: u64,
    /// Highest sequence confirmed fetched within this block. Starts at
    /// `range_begin`, or one below it once primed.
    pub progress_seq: u64,
    pub done: bool,
}

impl Block {
    #[must_use]
    pub fn new(id: u32, range_begin: u64, range_end: u64) -> Self {
        Self {
            id,
            range_begin,
            range_end,
            progress_seq: range_begin,
            done: false,
        }
    }

    /// Records still to fetch, used as the `limit` of the next request.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.range_end.saturating_sub(self.progress_seq)
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.range_end - self.range_begin
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range_end == self.range_begin
    }

    /// Apply progress up to `seq`. Progress never moves backwards and is
    /// clamped to `range_end`. Completion keeps the confirmed progress, which
    /// may sit below `range_end` under the minus-one boundary.
    /// Returns true if this call completed the block.
    pub fn advance(&mut self, seq: u64, boundary: CompletionBoundary) -> bool {
        if self.done {
            return false;
        }
        self.progress_seq = self.progress_seq.max(seq.min(self.range_end));
        if boundary.is_complete(self) {
            self.done = true;
            return true;
        }
        false
    }

    /// Mark the block finished through `range_end` regardless of progress.
    /// Used when the feed has nothing after the block's offset.
    pub fn complete(&mut self) {
        self.progress_seq = self.range_end;
        self.done = true;
    }
}

/// When a block's progress counts as complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionBoundary {
    /// `progress_seq >= range_end`.
    #[default]
    RangeEnd,
    /// `progress_seq >= range_end - 1`.
    RangeEndMinusOne,
}

impl CompletionBoundary {
    #[must_use]
    pub fn threshold(self, block: &Block) -> u64 {
        match self {
            Self::RangeEnd => block.range_end,
            Self::RangeEndMinusOne => block.range_end.saturating_sub(1).max(block.range_begin),
        }
    }

    #[must_use]
    pub fn is_complete(self, block: &Block) -> bool {
        block.progress_seq >= self.threshold(block)
    }
}

/// Start untouched blocks above `floor` one sequence early under the
/// minus-one boundary, so the record a predecessor may stop short of is still
/// fetched. A no-op for [`CompletionBoundary::RangeEnd`].
pub fn prime(blocks: &mut [Block], floor: u64, boundary: CompletionBoundary) {
    if boundary != CompletionBoundary::RangeEndMinusOne {
        return;
    }
    for block in blocks {
        if !block.done && block.progress_seq == block.range_begin && block.range_begin > floor {
            block.progress_seq = block.range_begin - 1;
        }
    }
}

/// Cut `[local, target)` into `ceil((target - local) / block_size)` blocks.
#[must_use]
pub fn partition(local: u64, target: u64, block_size: u64) -> Vec<Block> {
    append_blocks(Vec::new(), 0, local, target, block_size)
}

/// Append blocks from the end of `existing` up to `target`, leaving existing
/// blocks untouched. An empty list is partitioned from `local`.
#[must_use]
pub fn extend(existing: Vec<Block>, local: u64, target: u64, block_size: u64) -> Vec<Block> {
    let (next_id, from) = match existing.last() {
        Some(last) => (last.id + 1, last.range_end),
        None => (0, local),
    };
    append_blocks(existing, next_id, from, target, block_size)
}

fn append_blocks(
    mut blocks: Vec<Block>,
    mut id: u32,
    from: u64,
    target: u64,
    block_size: u64,
) -> Vec<Block> {
    let block_size = block_size.max(1);
    let mut begin = from;
    while begin < target {
        let end = begin.saturating_add(block_size).min(target);
        blocks.push(Block::new(id, begin, end));
        id += 1;
        begin = end;
    }
    blocks
}

/// Check the structural invariants of a persisted block list.
pub fn validate(blocks: &[Block]) -> Result<(), StorageError> {
    let corrupt = |details: String| StorageError::Corrupt {
        key: "blocks".to_string(),
        details,
    };
    for block in blocks {
        if block.range_begin > block.range_end {
            return Err(corrupt(format!("block {} has an inverted range", block.id)));
        }
        let lowest = block.range_begin.saturating_sub(1);
        if block.progress_seq < lowest || block.progress_seq > block.range_end {
            return Err(corrupt(format!(
                "block {} progress {} outside [{}, {}]",
                block.id, block.progress_seq, lowest, block.range_end
            )));
        }
    }
    for pair in blocks.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if b.id <= a.id {
            return Err(corrupt(format!("block ids out of order at {}", b.id)));
        }
        if b.range_begin != a.range_end {
            return Err(corrupt(format!(
                "gap or overlap between block {} and block {}",
                a.id, b.id
            )));
        }
    }
    Ok(())
}

/// Confirmed progress of the last block in the longest done prefix, or
/// `None` if the first block is not done (or there are no blocks).
///
/// Earlier blocks in the prefix that stopped short of their `range_end` are
/// covered by their primed successors, so only the last one bounds the mark.
#[must_use]
pub fn done_prefix_end(blocks: &[Block]) -> Option<u64> {
    blocks
        .iter()
        .take_while(|block| block.done)
        .last()
        .map(|block| block.progress_seq)
}

/// Blocks not yet finished.
#[must_use]
pub fn pending(blocks: &[Block]) -> usize {
    blocks.iter().filter(|block| !block.done).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(blocks: &[Block]) -> Vec<(u64, u64)> {
        blocks.iter().map(|b| (b.range_begin, b.range_end)).collect()
    }

    #[test]
    fn partition_covers_gap_exactly() {
        let blocks = partition(100, 350, 100);
        assert_eq!(ranges(&blocks), vec![(100, 200), (200, 300), (300, 350)]);
        assert_eq!(blocks.iter().map(|b| b.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(blocks.iter().all(|b| b.progress_seq == b.range_begin && !b.done));
    }

    #[test]
    fn partition_of_empty_gap_is_empty() {
        assert!(partition(500, 500, 100).is_empty());
        assert!(partition(600, 500, 100).is_empty());
    }

    #[test]
    fn extend_keeps_existing_and_continues_ids() {
        let mut blocks = partition(0, 200, 100);
        blocks[0].complete();
        blocks[1].advance(150, CompletionBoundary::RangeEnd);
        let extended = extend(blocks.clone(), 0, 450, 100);
        assert_eq!(&extended[..2], &blocks[..]);
        assert_eq!(ranges(&extended[2..]), vec![(200, 300), (300, 400), (400, 450)]);
        assert_eq!(extended[4].id, 4);
        validate(&extended).unwrap();
    }

    #[test]
    fn extend_empty_partitions_from_local() {
        let blocks = extend(Vec::new(), 50, 120, 50);
        assert_eq!(ranges(&blocks), vec![(50, 100), (100, 120)]);
    }

    #[test]
    fn advance_clamps_and_completes() {
        let mut block = Block::new(0, 100, 200);
        assert!(!block.advance(150, CompletionBoundary::RangeEnd));
        assert!(!block.advance(120, CompletionBoundary::RangeEnd));
        assert_eq!(block.progress_seq, 150);
        assert!(block.advance(260, CompletionBoundary::RangeEnd));
        assert_eq!(block.progress_seq, 200);
        assert!(block.done);
        assert!(!block.advance(300, CompletionBoundary::RangeEnd));
    }

    #[test]
    fn minus_one_boundary_completes_early() {
        let mut block = Block::new(0, 100, 200);
        assert!(!block.advance(198, CompletionBoundary::RangeEndMinusOne));
        assert!(block.advance(199, CompletionBoundary::RangeEndMinusOne));
        assert_eq!(block.progress_seq, 199);
        assert_eq!(done_prefix_end(&[block]), Some(199));

        let mut strict = Block::new(0, 100, 200);
        assert!(!strict.advance(199, CompletionBoundary::RangeEnd));
    }

    #[test]
    fn done_prefix_stops_at_first_gap() {
        let mut blocks = partition(0, 400, 100);
        assert_eq!(done_prefix_end(&blocks), None);
        blocks[1].complete();
        blocks[3].complete();
        assert_eq!(done_prefix_end(&blocks), None);
        blocks[0].complete();
        assert_eq!(done_prefix_end(&blocks), Some(200));
        blocks[2].complete();
        assert_eq!(done_prefix_end(&blocks), Some(400));
        assert_eq!(pending(&blocks), 0);
    }

    #[test]
    fn prime_starts_successors_one_early() {
        let mut blocks = partition(100, 400, 100);
        blocks[2].advance(320, CompletionBoundary::RangeEndMinusOne);
        prime(&mut blocks, 100, CompletionBoundary::RangeEndMinusOne);
        assert_eq!(blocks[0].progress_seq, 100);
        assert_eq!(blocks[1].progress_seq, 199);
        assert_eq!(blocks[1].remaining(), 101);
        assert_eq!(blocks[2].progress_seq, 320);
        validate(&blocks).unwrap();

        let mut strict = partition(100, 400, 100);
        prime(&mut strict, 100, CompletionBoundary::RangeEnd);
        assert_eq!(strict, partition(100, 400, 100));
    }

    #[test]
    fn minus_one_prefix_never_claims_the_unfetched_end() {
        let mut blocks = partition(0, 300, 100);
        prime(&mut blocks, 0, CompletionBoundary::RangeEndMinusOne);
        blocks[0].advance(99, CompletionBoundary::RangeEndMinusOne);
        assert_eq!(done_prefix_end(&blocks), Some(99));
        blocks[1].advance(200, CompletionBoundary::RangeEndMinusOne);
        assert_eq!(done_prefix_end(&blocks), Some(200));
    }

    #[test]
    fn validate_rejects_broken_lists() {
        let mut blocks = partition(0, 300, 100);
        blocks[1].range_begin = 150;
        blocks[1].progress_seq = 150;
        assert!(validate(&blocks).is_err());

        let mut blocks = partition(0, 300, 100);
        blocks[2].progress_seq = 50;
        assert!(validate(&blocks).is_err());

        let mut blocks = partition(0, 300, 100);
        blocks.swap(0, 1);
        assert!(validate(&blocks).is_err());
    }
}
