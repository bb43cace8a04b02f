//! Order-preserving byte encodings for range-scannable keys.

use std::ops::Bound;

const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

/// Smallest key strictly greater than every key starting with `prefix`,
/// or `None` if no such key exists (empty or all-`0xFF` prefix).
#[must_use]
pub fn successor(mut prefix: Vec<u8>) -> Option<Vec<u8>> {
    while let Some(last) = prefix.pop() {
        if last < 0xFF {
            prefix.push(last + 1);
            return Some(prefix);
        }
        // 0xFF carries into the previous byte
    }
    None
}

/// Bounds covering exactly the keys that start with `prefix`.
#[must_use]
pub fn prefix_range(prefix: Vec<u8>) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(prefix.clone());
    let end = successor(prefix).map_or(Bound::Unbounded, Bound::Excluded);
    (start, end)
}

/// Big-endian two's complement with the sign bit flipped, so byte order
/// equals numeric order across negative and positive values.
#[must_use]
pub fn encode_i64_sortable(val: i64) -> [u8; 8] {
    (u64::from_be_bytes(val.to_be_bytes()) ^ SIGN_BIT).to_be_bytes()
}

#[must_use]
pub fn decode_i64_sortable(bytes: [u8; 8]) -> i64 {
    i64::from_be_bytes((u64::from_be_bytes(bytes) ^ SIGN_BIT).to_be_bytes())
}

/// Borrow an owned bound.
#[must_use]
pub fn bound_as_slice(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// True when no key can satisfy both bounds. `BTreeMap::range` panics on
/// such ranges, so every scan checks this first.
#[must_use]
pub fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
        _ => false,
    }
}
