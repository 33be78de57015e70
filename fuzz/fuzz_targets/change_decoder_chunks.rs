#![no_main]

use libfuzzer_sys::fuzz_target;
use regtail_core::changes::{ChangeDecoder, decode_all};

/// First byte picks the chunk width; the rest is the body.
fn chunks(data: &[u8]) -> (usize, &[u8]) {
    match data.split_first() {
        Some((width, body)) => (usize::from(*width % 64) + 1, body),
        None => (1, data),
    }
}

fuzz_target!(|data: &[u8]| {
    let (width, body) = chunks(data);

    let whole = decode_all(body);

    let mut decoder = ChangeDecoder::new();
    let mut split = Vec::new();
    for chunk in body.chunks(width) {
        let batch = decoder.push(chunk);
        assert_eq!(
            batch.last_seq,
            batch.records.iter().map(|r| r.sequence).max()
        );
        split.extend(batch.records);
    }
    split.extend(decoder.finish().records);

    assert_eq!(decoder.buffered_len(), 0);
    assert_eq!(decoder.decoded(), split.len() as u64);
    assert_eq!(whole, split, "chunking changed the decoded records");

    for record in &whole {
        let line = serde_json::to_vec(record).expect("record serializes");
        assert_eq!(decode_all(&line), vec![record.clone()]);
    }
});
