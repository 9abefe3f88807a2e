//! Sparse-iterator bit-vector encoding.
//!
//! The runtime walks role-state keys through a bit-vector-plus-iterator
//! structure stored in the engine blob. The encoding is a fixed header
//! (`total_keys: u32`, `set_keys: u32`, little-endian) followed by
//! `ceil(total_keys / 64)` little-endian `u64` words with one bit per key.
//! The encoder is deterministic, which keeps assembly reproducible and
//! lets the blob intern identical iterators.

use bramble_error::{BrambleError, Result};

/// Length of the iterator header preceding the bit words.
pub const SPARSE_ITER_HEADER_LEN: usize = 8;

/// Build the serialised sparse-iterator bit-vector for `keys` drawn from a
/// key space of `total_keys`.
///
/// Duplicate keys are tolerated and set the bit once.
///
/// # Errors
///
/// `ValueOutOfRange` if any key is not below `total_keys`.
pub fn build_sparse_iter(total_keys: u32, keys: &[u32]) -> Result<Vec<u8>> {
    let words = usize::try_from(total_keys.div_ceil(64)).expect("word count fits usize");
    let mut bits = vec![0u64; words];
    for &key in keys {
        if key >= total_keys {
            return Err(BrambleError::out_of_range(
                "sparse iterator key",
                u64::from(key),
            ));
        }
        bits[(key / 64) as usize] |= 1u64 << (key % 64);
    }

    let set_keys: u32 = bits.iter().map(|w| w.count_ones()).sum();

    let mut out = Vec::with_capacity(SPARSE_ITER_HEADER_LEN + 8 * words);
    out.extend_from_slice(&total_keys.to_le_bytes());
    out.extend_from_slice(&set_keys.to_le_bytes());
    for word in bits {
        out.extend_from_slice(&word.to_le_bytes());
    }
    Ok(out)
}
