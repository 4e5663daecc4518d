// Property: decrypt(encrypt(payload)) is byte-identical to the payload, for
// both supported key sizes, and the IV is fresh per invocation.

use chunkflow::{SecurityConfig, SecurityGate};
use proptest::prelude::*;

fn gate_with_key_size(key_size: usize) -> SecurityGate {
    let mut config = SecurityConfig::default();
    config.encryption.enabled = true;
    config.encryption.key_size = key_size;
    let gate = SecurityGate::new(config);
    gate.create_encryption_key("file-1").unwrap();
    gate
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// AES-256-GCM round trip
    #[test]
    fn prop_round_trip_256(payload in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let gate = gate_with_key_size(256);
        let sealed = gate.encrypt_chunk("file-1", &payload).unwrap();
        let opened = gate.decrypt_chunk("file-1", &sealed).unwrap();
        prop_assert_eq!(opened.as_ref(), payload.as_slice());
    }

    /// AES-128-GCM round trip
    #[test]
    fn prop_round_trip_128(payload in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let gate = gate_with_key_size(128);
        let sealed = gate.encrypt_chunk("file-1", &payload).unwrap();
        let opened = gate.decrypt_chunk("file-1", &sealed).unwrap();
        prop_assert_eq!(opened.as_ref(), payload.as_slice());
    }

    /// Output is IV ‖ ciphertext: 12-byte IV plus payload plus 16-byte tag
    #[test]
    fn prop_output_framing(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let gate = gate_with_key_size(256);
        let sealed = gate.encrypt_chunk("file-1", &payload).unwrap();
        prop_assert_eq!(sealed.len(), 12 + payload.len() + 16);
    }

    /// Two encryptions of the same payload differ (fresh IV each time)
    #[test]
    fn prop_fresh_iv(payload in proptest::collection::vec(any::<u8>(), 1..1024)) {
        let gate = gate_with_key_size(256);
        let a = gate.encrypt_chunk("file-1", &payload).unwrap();
        let b = gate.encrypt_chunk("file-1", &payload).unwrap();
        prop_assert_ne!(&a[..12], &b[..12]);
    }

    /// Flipping any single byte breaks authentication
    #[test]
    fn prop_tamper_detection(
        payload in proptest::collection::vec(any::<u8>(), 1..1024),
        flip in any::<prop::sample::Index>(),
    ) {
        let gate = gate_with_key_size(256);
        let sealed = gate.encrypt_chunk("file-1", &payload).unwrap();

        let mut tampered = sealed.to_vec();
        let pos = flip.index(tampered.len());
        tampered[pos] ^= 0xFF;
        prop_assert!(gate.decrypt_chunk("file-1", &tampered).is_err());
    }
}

#[test]
fn decrypt_requires_bound_key() {
    let gate = gate_with_key_size(256);
    let sealed = gate.encrypt_chunk("file-1", b"data").unwrap();
    gate.destroy_encryption_key("file-1");
    assert!(gate.decrypt_chunk("file-1", &sealed).is_err());
}
