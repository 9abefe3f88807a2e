//! The engine blob: an append-only byte arena for side data.
//!
//! Instruction records are fixed-size; anything variable-length (sparse
//! iterator bit-vectors, jump tables, lookaround tables) is written here
//! and referenced from records by 4-byte offsets from the blob base.
//!
//! Identical payloads are interned: writing the same `(bytes, align)` pair
//! twice returns the first offset. Equivalent programs assembled against a
//! shared blob therefore record identical blob offsets, which is what lets
//! program equivalence imply byte-identical assembly.

use std::collections::HashMap;

use bramble_error::{BrambleError, Result};
use bramble_types::{verify_u32, MAX_BLOB_LEN};
use tracing::trace;

/// Append-only aligned byte arena shared by the programs of one engine
/// image. Written by one caller at a time; not thread-safe by design.
#[derive(Debug, Default)]
pub struct EngineBlob {
    data: Vec<u8>,
    limit: usize,
    interned: HashMap<(usize, Vec<u8>), u32>,
}

impl EngineBlob {
    /// Create an empty blob bounded by [`MAX_BLOB_LEN`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_BLOB_LEN)
    }

    /// Create an empty blob with an explicit capacity bound.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit: limit.min(MAX_BLOB_LEN),
            interned: HashMap::new(),
        }
    }

    /// Bytes written so far (including alignment padding).
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The accumulated blob contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append `bytes` at the next `align`-aligned offset and return that
    /// offset. Padding bytes are zero. If an identical payload was already
    /// written at this alignment, its offset is returned and nothing is
    /// appended.
    ///
    /// # Errors
    ///
    /// `BlobFull` when the write would exceed the capacity bound.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn write(&mut self, bytes: &[u8], align: usize) -> Result<u32> {
        assert!(align.is_power_of_two(), "blob alignment must be a power of two");

        let key = (align, bytes.to_vec());
        if let Some(&offset) = self.interned.get(&key) {
            return Ok(offset);
        }

        let padded = bramble_types::align_up(self.data.len(), align);
        let end = padded + bytes.len();
        if end > self.limit {
            return Err(BrambleError::BlobFull {
                needed: end - self.data.len(),
                capacity: self.limit - self.data.len(),
            });
        }

        self.data.resize(padded, 0);
        self.data.extend_from_slice(bytes);
        let offset = verify_u32("blob offset", padded)?;
        trace!(offset, len = bytes.len(), align, "blob write");
        self.interned.insert(key, offset);
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_at_zero() {
        let mut blob = EngineBlob::new();
        assert!(blob.is_empty());
        let off = blob.write(&[1, 2, 3], 4).unwrap();
        assert_eq!(off, 0);
        assert_eq!(blob.len(), 3);
    }

    #[test]
    fn writes_are_aligned_and_padded_with_zero() {
        let mut blob = EngineBlob::new();
        blob.write(&[0xaa], 1).unwrap();
        let off = blob.write(&[0xbb, 0xcc], 8).unwrap();
        assert_eq!(off, 8);
        assert_eq!(&blob.as_bytes()[0..8], &[0xaa, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&blob.as_bytes()[8..10], &[0xbb, 0xcc]);
    }

    #[test]
    fn identical_payloads_intern_to_first_offset() {
        let mut blob = EngineBlob::new();
        let a = blob.write(&[1, 2, 3, 4], 4).unwrap();
        blob.write(&[9], 1).unwrap();
        let b = blob.write(&[1, 2, 3, 4], 4).unwrap();
        assert_eq!(a, b);
        // Same bytes at a different alignment are a distinct payload.
        let c = blob.write(&[1, 2, 3, 4], 8).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn capacity_exhaustion() {
        let mut blob = EngineBlob::with_limit(8);
        blob.write(&[0; 6], 1).unwrap();
        let err = blob.write(&[0xff; 4], 1).unwrap_err();
        assert!(matches!(
            err,
            BrambleError::BlobFull {
                needed: 4,
                capacity: 2
            }
        ));
        // The failed write must not have changed the blob.
        assert_eq!(blob.len(), 6);
    }

    #[test]
    fn alignment_padding_counts_against_capacity() {
        let mut blob = EngineBlob::with_limit(8);
        blob.write(&[1], 1).unwrap();
        let err = blob.write(&[2, 3, 4, 5], 8).unwrap_err();
        assert!(matches!(err, BrambleError::BlobFull { .. }));
    }
}
