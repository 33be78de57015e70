//! Property-based tests for change-feed decoding and the plugin filter.
//!
//! The decoder must produce the same records no matter how the body is cut
//! into chunks, and must never fail on garbage.

use futures::StreamExt;
use futures::stream;
use proptest::prelude::*;

use regtail_core::changes::{ChangeDecoder, ChangeRecord, ChangeStream, Revision, decode_all};
use regtail_core::error::FetchError;
use regtail_core::filter;
use regtail_core::shutdown::Shutdown;

// =============================================================================
// Strategies
// =============================================================================

fn arb_package_id() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9\\-]{0,20}",
        "koishi-plugin-[a-z0-9\\-]{1,16}",
        "@[a-z]{1,8}/koishi-plugin-[a-z0-9]{1,12}",
        "@koishijs/plugin-[a-z0-9\\-]{1,12}",
        "@[a-z]{1,8}/[a-z0-9]{1,12}",
    ]
}

/// Records with strictly increasing sequences.
fn arb_records() -> impl Strategy<Value = Vec<ChangeRecord>> {
    prop::collection::vec((1u64..50, arb_package_id(), any::<bool>(), 0usize..3), 0..40).prop_map(
        |entries| {
            let mut seq = 0;
            entries
                .into_iter()
                .map(|(step, package_id, deleted, revs)| {
                    seq += step;
                    ChangeRecord {
                        sequence: seq,
                        package_id,
                        revisions: (0..revs)
                            .map(|n| Revision {
                                rev: format!("{}-{seq:x}", n + 1),
                            })
                            .collect(),
                        deleted,
                    }
                })
                .collect()
        },
    )
}

fn render(records: &[ChangeRecord]) -> Vec<u8> {
    let lines: Vec<String> = records
        .iter()
        .map(|r| serde_json::to_string(r).unwrap())
        .collect();
    let last_seq = records.last().map_or(0, |r| r.sequence);
    format!(
        "{{\"results\":[\n{}\n],\n\"last_seq\":{last_seq},\"pending\":0}}\n",
        lines.join(",\n")
    )
    .into_bytes()
}

/// Cut `body` at the given fractional positions.
fn split_at_points(body: &[u8], points: &[f64]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = points
        .iter()
        .map(|p| ((body.len() as f64) * p) as usize)
        .collect();
    cuts.sort_unstable();
    cuts.dedup();
    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        let cut = cut.min(body.len());
        chunks.push(body[start..cut].to_vec());
        start = cut;
    }
    chunks.push(body[start..].to_vec());
    chunks
}

// =============================================================================
// Decoder
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn chunking_does_not_change_records(
        records in arb_records(),
        points in prop::collection::vec(0.0f64..1.0, 0..24),
    ) {
        let body = render(&records);
        prop_assert_eq!(decode_all(&body), records.clone());

        let mut decoder = ChangeDecoder::new();
        let mut decoded = Vec::new();
        for chunk in split_at_points(&body, &points) {
            let batch = decoder.push(&chunk);
            prop_assert_eq!(batch.last_seq, batch.records.last().map(|r| r.sequence));
            decoded.extend(batch.records);
        }
        decoded.extend(decoder.finish().records);
        prop_assert_eq!(decoder.decoded(), records.len() as u64);
        prop_assert_eq!(decoder.buffered_len(), 0);
        prop_assert_eq!(decoded, records);
    }

    #[test]
    fn byte_at_a_time_matches_whole_body(records in arb_records()) {
        let body = render(&records);
        let mut decoder = ChangeDecoder::new();
        let mut decoded = Vec::new();
        for byte in &body {
            decoded.extend(decoder.push(std::slice::from_ref(byte)).records);
        }
        decoded.extend(decoder.finish().records);
        prop_assert_eq!(decoded, records);
    }

    #[test]
    fn garbage_never_panics(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16)) {
        let mut decoder = ChangeDecoder::new();
        let mut total = 0u64;
        for chunk in &chunks {
            total += decoder.push(chunk).records.len() as u64;
        }
        total += decoder.finish().records.len() as u64;
        prop_assert_eq!(total, decoder.decoded());
    }

    #[test]
    fn stream_yields_every_record(
        records in arb_records(),
        points in prop::collection::vec(0.0f64..1.0, 0..12),
    ) {
        let body = render(&records);
        let chunks: Vec<Result<bytes::Bytes, FetchError>> = split_at_points(&body, &points)
            .into_iter()
            .map(|chunk| Ok(bytes::Bytes::from(chunk)))
            .collect();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let decoded = runtime.block_on(async move {
            let mut stream = ChangeStream::new(stream::iter(chunks).boxed(), Shutdown::never());
            let mut decoded = Vec::new();
            while let Some(batch) = stream.next_batch().await.unwrap() {
                assert!(!batch.is_empty());
                decoded.extend(batch.records);
            }
            decoded
        });
        prop_assert_eq!(decoded, records);
    }
}

// =============================================================================
// Filter
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn plugin_names_are_relevant(name in "[a-z0-9][a-z0-9\\-]{0,20}", scope in "[a-z][a-z0-9]{0,10}") {
        let community = format!("koishi-plugin-{name}");
        let scoped = format!("@{scope}/koishi-plugin-{name}");
        let first_party = format!("@koishijs/plugin-{name}");
        prop_assert!(filter::is_relevant(&community));
        prop_assert!(filter::is_relevant(&scoped));
        prop_assert!(filter::is_relevant(&first_party));
        prop_assert!(filter::is_first_party(&first_party));
        prop_assert!(!filter::is_first_party(&community));
        prop_assert_eq!(filter::short_name(&community), Some(name.as_str()));
        prop_assert_eq!(filter::short_name(&scoped), Some(name.as_str()));
        prop_assert_eq!(filter::short_name(&first_party), Some(name.as_str()));
    }

    #[test]
    fn names_without_trigger_are_irrelevant(id in "[a-z@/][a-z0-9\\-/]{0,30}") {
        prop_assume!(!id.contains("plugin-"));
        prop_assert!(!filter::is_relevant(&id));
        prop_assert_eq!(filter::short_name(&id), None);
    }
}
