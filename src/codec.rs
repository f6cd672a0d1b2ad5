//! Big-endian integer decoding and the random range-splitting helper used by
//! both the TLS record fragmenter and the TCP write chunker.

use rand::Rng;
use std::ops::Range;

/// Decode a big-endian `u16` from the first two bytes of `bytes`.
///
/// # Panics
/// Panics if `bytes.len() < 2`; callers are expected to have already
/// validated the slice length before calling.
pub fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Decode a big-endian, zero-extended unsigned integer from up to four
/// bytes. Used for the 1-byte session_id length and 3-byte handshake
/// length fields, where the field width varies.
pub fn be32(bytes: &[u8]) -> u32 {
    debug_assert!(bytes.len() <= 4);
    let mut buf = [0u8; 4];
    let start = 4 - bytes.len();
    buf[start..].copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

/// Encode `value` as two big-endian bytes.
pub fn be16_encode(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Partition `range` into consecutive sub-ranges, each at least `min_len`
/// long except possibly the last.
///
/// At least one cut is attempted whenever `range.len() >= 2 * min_len`;
/// below that the whole range is returned as a single piece. The split
/// points are chosen with a non-cryptographic PRNG; the transform this
/// feeds is correctness-neutral regardless of where the cuts land, so the
/// thread-local generator is precise enough here.
pub fn random_slice(range: Range<usize>, min_len: usize) -> Vec<Range<usize>> {
    assert!(min_len > 0, "min_len must be positive");

    let mut rng = rand::rng();
    let mut pieces = Vec::new();
    let mut start = range.start;

    while range.end - start >= 2 * min_len {
        let remaining = range.end - start;
        // Leave at least min_len for everything after this cut.
        let max_cut = remaining - min_len;
        let cut_len = rng.random_range(min_len..=max_cut);
        pieces.push(start..start + cut_len);
        start += cut_len;
    }

    if start < range.end {
        pieces.push(start..range.end);
    }

    pieces
}
