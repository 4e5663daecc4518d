// Property: decompress(compress(payload)) is byte-identical to the payload.

use chunkflow::Compressor;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Round trip over arbitrary payloads above the compression gate
    #[test]
    fn prop_round_trip(payload in proptest::collection::vec(any::<u8>(), 1025..16_384)) {
        let compressor = Compressor::new();
        let out = compressor.compress(&payload).unwrap();
        prop_assert!(out.compressed);

        let restored = compressor.decompress(&out.data).unwrap();
        prop_assert_eq!(restored.as_ref(), payload.as_slice());
    }

    /// Payloads at or under the gate pass through untouched
    #[test]
    fn prop_small_payloads_pass_through(payload in proptest::collection::vec(any::<u8>(), 0..=1024)) {
        let compressor = Compressor::new();
        let out = compressor.compress(&payload).unwrap();
        prop_assert!(!out.compressed);
        prop_assert_eq!(out.data.as_ref(), payload.as_slice());
        prop_assert_eq!(out.stats.ratio, 1.0);
    }

    /// Stats are consistent with the actual sizes
    #[test]
    fn prop_stats_consistent(payload in proptest::collection::vec(any::<u8>(), 1025..8192)) {
        let compressor = Compressor::new();
        let out = compressor.compress(&payload).unwrap();
        prop_assert_eq!(out.stats.original_size, payload.len());
        prop_assert_eq!(out.stats.compressed_size, out.data.len());

        let expected_ratio = out.data.len() as f64 / payload.len() as f64;
        prop_assert!((out.stats.ratio - expected_ratio).abs() < 1e-9);
    }
}
