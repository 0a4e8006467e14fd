use anyhow::Result;

use crate::utils;

#[test]
fn encode_decode_u64_preserves_order() -> Result<()> {
    let (low, high) = (utils::encode_u64(9), utils::encode_u64(300));
    assert!(low < high, "expected big-endian encoding to sort numerically");
    let decoded = utils::decode_u64(&high)?;
    assert!(decoded == 300, "expected decoded value 300 got {}", decoded);
    Ok(())
}

#[test]
fn decode_u64_rejects_bad_length() {
    let res = utils::decode_u64(&[0, 1, 2]);
    assert!(res.is_err(), "expected error decoding a 3 byte slice as u64");
}

#[test]
fn encode_byte_prefix_keeps_prefix_and_order() {
    let (a, b) = (utils::encode_byte_prefix(b"t", 1), utils::encode_byte_prefix(b"t", 256));
    assert!(a[0] == b't', "expected prefix byte to be preserved, got {}", a[0]);
    assert!(a < b, "expected prefixed keys to sort numerically");
}

#[test]
fn stable_hash_is_deterministic() {
    let (a, b) = (utils::stable_hash(b"backup/1"), utils::stable_hash(b"backup/1"));
    assert!(a == b, "expected the same input to hash identically");
    let c = utils::stable_hash(b"backup/2");
    assert!(a != c, "expected different inputs to hash differently");
}

#[test]
fn jump_consistent_hash_stays_in_range() {
    for key in 0..500u64 {
        let bucket = utils::jump_consistent_hash(utils::mix_hash(key), 3);
        assert!(bucket < 3, "expected bucket below 3 got {}", bucket);
    }
    assert!(utils::jump_consistent_hash(42, 1) == 0, "expected single bucket to always be 0");
    assert!(utils::jump_consistent_hash(42, 0) == 0, "expected empty bucket set to map to 0");
}

#[test]
fn jump_consistent_hash_spreads_keys() {
    let mut counts = [0usize; 3];
    for key in 0..3000u64 {
        counts[utils::jump_consistent_hash(utils::mix_hash(key), 3)] += 1;
    }
    for (idx, count) in counts.iter().enumerate() {
        assert!(*count > 500, "expected bucket {} to receive a fair share of keys, got {}", idx, count);
    }
}
