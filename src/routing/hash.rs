use crate::core::Value;

const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// 64-bit FNV-1a. Stable across processes and platforms.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Final avalanche step (murmur3 fmix64). Plain FNV-1a low bits depend only
/// on the low bits of each input byte, which skews `mod 2^k`.
fn fmix64(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51afd7ed558ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ceb9fe1a85ec53);
    hash ^= hash >> 33;
    hash
}

/// Hash of a routing value over its canonical text form.
///
/// Floats are folded first so that equal values (`0.0` and `-0.0`) render,
/// and therefore route, identically.
pub fn stable_hash(value: &Value) -> u64 {
    let text = match value {
        Value::Float(f) => Value::Float(Value::canonical_float(*f)).to_string(),
        other => other.to_string(),
    };
    fmix64(fnv1a(text.as_bytes()))
}

/// Partition index for `value` in a cluster of `partition_count` partitions.
pub fn partition_for(value: &Value, partition_count: usize) -> usize {
    if partition_count == 0 {
        return 0;
    }
    (stable_hash(value) % partition_count as u64) as usize
}
