#![no_main]

use libfuzzer_sys::fuzz_target;
use regtail_core::blocks::{self, CompletionBoundary};
use regtail_core::catchup;

fn u64_at(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    for (slot, byte) in bytes.iter_mut().zip(data.iter().skip(at)) {
        *slot = *byte;
    }
    u64::from_le_bytes(bytes)
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 24 {
        return;
    }
    let local = u64_at(data, 0) % 1_000_000;
    let target = local + u64_at(data, 8) % 5_000;
    let block_size = u64_at(data, 16) % 700 + 1;
    let boundary = if data[0] & 1 == 0 {
        CompletionBoundary::RangeEnd
    } else {
        CompletionBoundary::RangeEndMinusOne
    };

    let mut plan = blocks::partition(local, target, block_size);
    blocks::prime(&mut plan, local, boundary);
    assert!(blocks::validate(&plan).is_ok());

    // Remaining bytes drive progress reports: (block index, offset).
    let mut mark = local;
    for step in data[24..].chunks(2) {
        if plan.is_empty() {
            break;
        }
        let index = usize::from(step[0]) % plan.len();
        let offset = u64::from(*step.get(1).unwrap_or(&0)) * block_size / 255;
        let seq = plan[index].range_begin + offset;
        plan[index].advance(seq, boundary);

        let next = blocks::done_prefix_end(&plan).unwrap_or(local).max(mark);
        assert!(next >= mark);
        for block in plan.iter().filter(|b| !b.done) {
            assert!(next <= block.range_begin);
        }
        mark = next;
    }

    // A partially finished plan is always reusable from its own mark.
    let reused = catchup::plan(plan.clone(), mark, target, block_size, boundary);
    assert!(!reused.discarded);
    assert!(blocks::validate(&reused.blocks).is_ok());
    for (kept, before) in reused.blocks.iter().zip(&plan) {
        assert_eq!((kept.id, kept.range_begin, kept.range_end), (before.id, before.range_begin, before.range_end));
        assert_eq!(kept.done, before.done);
        assert!(kept.progress_seq + 1 >= before.progress_seq);
    }
});
