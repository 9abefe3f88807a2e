//! Foundational types for the Bramble program bytecode.
//!
//! This crate owns the wire-level contract shared by the IR builder and the
//! scan-time interpreter: the opcode catalogue with its packed record
//! layouts, the fixed SOM operation payload, scalar aliases, and the
//! alignment and addressing limits of an emitted program.

pub mod opcode;
pub mod som;

pub use opcode::Opcode;
pub use som::SomOperation;

use bramble_error::{BrambleError, Result};

/// Match report identifier, handed to the caller on a successful match.
pub type ReportId = u32;

/// Literal-group membership bitmap. Each bit enables one group of literals
/// in the literal matcher.
pub type GroupMask = u64;

/// Minimum alignment of an instruction record in the emitted bytecode.
/// Record offsets are multiples of this; padding between records is zero.
pub const INSTR_MIN_ALIGN: usize = 8;

/// Upper bound on the byte length of a single assembled program. Target
/// fields are 4-byte absolute offsets, so programs must stay addressable
/// by `u32`.
pub const MAX_PROGRAM_LEN: u64 = u32::MAX as u64;

/// Default capacity bound of the auxiliary blob. Blob references in
/// instruction records are 4-byte offsets.
pub const MAX_BLOB_LEN: usize = u32::MAX as usize;

/// Round `n` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Narrow a `usize` into the 4-byte width used for offsets and counts in
/// instruction records.
#[inline]
pub fn verify_u32(what: &'static str, n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| BrambleError::out_of_range(what, n as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(77, 8), 80);
        assert_eq!(align_up(5, 4), 8);
    }

    #[test]
    fn verify_u32_in_range() {
        assert_eq!(verify_u32("x", 0).unwrap(), 0);
        assert_eq!(verify_u32("x", 123_456).unwrap(), 123_456);
        assert_eq!(verify_u32("x", u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[test]
    fn verify_u32_out_of_range() {
        let err = verify_u32("jump count", (u32::MAX as usize) + 1).unwrap_err();
        assert!(matches!(
            err,
            BrambleError::ValueOutOfRange {
                what: "jump count",
                ..
            }
        ));
    }
}
