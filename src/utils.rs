use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode a byte + u64 prefix key.
///
/// This allows for efficient BTree prefix storage where the u64 portion sorts numerically.
pub fn encode_byte_prefix(prefix: &[u8; 1], offset: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix[0];
    key[1..].copy_from_slice(&encode_u64(offset));
    key
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(model).context("error serializing data model")
}

/// Decode an object from the given buffer.
pub fn decode_model<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding object from storage")
}

/// A stable 64-bit FNV-1a hash of the given bytes.
///
/// Used where a hash must agree across nodes and process restarts.
pub fn stable_hash(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter().fold(OFFSET, |hash, byte| (hash ^ *byte as u64).wrapping_mul(PRIME))
}

/// Jump consistent hash, mapping `key` onto one of `buckets` buckets.
pub fn jump_consistent_hash(mut key: u64, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    let (mut b, mut j) = (-1i64, 0i64);
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * ((1i64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64))) as i64;
    }
    b as usize
}

/// Mix the bits of a hash, used to derive a fresh key after a collision.
pub fn mix_hash(mut key: u64) -> u64 {
    key ^= key >> 33;
    key = key.wrapping_mul(0xff51_afd7_ed55_8ccd);
    key ^= key >> 33;
    key = key.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    key ^= key >> 33;
    key
}

/// Convert a chrono duration into a std duration, clamping negative values to zero.
pub fn to_std_duration(val: chrono::Duration) -> std::time::Duration {
    val.to_std().unwrap_or_default()
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono_duration(val: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(val).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// The time elapsed since `since`, never negative.
pub fn elapsed_since(now: DateTime<Utc>, since: DateTime<Utc>) -> std::time::Duration {
    to_std_duration(now - since)
}
