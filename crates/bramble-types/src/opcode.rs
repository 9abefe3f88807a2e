//! The Bramble program opcode catalogue.
//!
//! Each opcode identifies one instruction kind in the bytecode that the
//! scan-time interpreter executes, and binds a packed on-wire record
//! layout with a fixed byte length. The first byte of every record is the
//! opcode value; multi-byte fields are little-endian; record offsets are
//! aligned to [`crate::INSTR_MIN_ALIGN`].

use crate::som::SOM_OPERATION_LEN;

/// Instruction opcodes, numbered sequentially from 1 (0 is reserved and
/// never appears in emitted bytecode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // === Delay and group gating ===
    /// Fall through to the done target unless the match is anchored-delayed.
    AnchoredDelay = 1,
    /// Check that the literal matched at or after a minimum offset.
    CheckLitEarly = 2,
    /// Check that at least one of the literal's groups is still on.
    CheckGroups = 3,

    // === Stream-position checks ===
    /// Check that the match sits exactly at end of data.
    CheckOnlyEod = 4,
    /// Check that the end offset lies inside `[min, max]`.
    CheckBounds = 5,
    /// Check that a match key has not already been handled at this offset.
    CheckNotHandled = 6,
    /// Check a lookaround table entry range against the history buffer.
    CheckLookaround = 7,
    /// Check up to eight bytes against and/compare masks.
    CheckMask = 8,
    /// Check 32 bytes against inline and/compare mask vectors.
    CheckMask32 = 9,
    /// Check a single byte against an and/compare mask.
    CheckByte = 10,
    /// Check that an infix engine can accept this match.
    CheckInfix = 11,
    /// Check that a prefix engine can accept this match.
    CheckPrefix = 12,

    // === Delayed and anchored bookkeeping ===
    /// Push a delayed-literal rebuild record.
    PushDelayed = 13,
    /// Record an anchored literal match for the DFA replay log.
    RecordAnchored = 14,

    // === Catch-up ===
    /// Catch outstanding engines up to the current offset.
    CatchUp = 15,
    /// Catch the MPV (chained puff) engine up to the current offset.
    CatchUpMpv = 16,

    // === Start-of-match ===
    /// Adjust start of match back by a fixed distance.
    SomAdjust = 17,
    /// Read start of match from a left-fix engine.
    SomLeftfix = 18,
    /// Derive start of match from a SOM operation payload.
    SomFromReport = 19,
    /// Set start of match to the current offset.
    SomZero = 20,

    // === Engine triggers ===
    /// Fire a top event into an infix engine queue.
    TriggerInfix = 21,
    /// Fire a top event into a suffix engine queue.
    TriggerSuffix = 22,

    // === Dedupe ===
    /// Deduplicate an external report.
    Dedupe = 23,
    /// Deduplicate a SOM-carrying external report.
    DedupeSom = 24,

    // === Reports ===
    /// Report a chained (MPV) internal event.
    ReportChain = 25,
    /// Write start of match to an internal SOM slot.
    ReportSomInt = 26,
    /// Fire a SOM-aware internal report.
    ReportSomAware = 27,
    /// Fire an external report callback.
    Report = 28,
    /// Fire an external report and set an exhaustion key.
    ReportExhaust = 29,
    /// Fire an external report carrying start of match.
    ReportSom = 30,
    /// Fire a SOM report and set an exhaustion key.
    ReportSomExhaust = 31,
    /// Fused dedupe-then-report.
    DedupeAndReport = 32,
    /// Fire the last report of a program, then stop.
    FinalReport = 33,

    // === Post-report checks and state ===
    /// Check that a report's exhaustion key is not yet set.
    CheckExhausted = 34,
    /// Check that the match satisfies a minimum length.
    CheckMinLength = 35,
    /// Switch on a role state bit.
    SetState = 36,
    /// Turn literal groups on.
    SetGroups = 37,
    /// Turn literal groups off.
    SquashGroups = 38,
    /// Check that a predecessor role state bit is on.
    CheckState = 39,

    // === Sparse iterators over role state ===
    /// Begin iterating set role-state keys; dispatch via a jump table.
    SparseIterBegin = 40,
    /// Resume a sparse iteration from a known state key.
    SparseIterNext = 41,
    /// Check that any of a set of role-state keys is on.
    SparseIterAny = 42,

    // === End-of-data sweep ===
    /// Run outstanding engines at end of data via a sparse iterator.
    EnginesEod = 43,
    /// Run suffix engines at end of data.
    SuffixesEod = 44,
    /// Run the EOD literal matcher.
    MatcherEod = 45,

    // === Terminator (always last) ===
    /// End of program.
    End = 46,
}

impl Opcode {
    /// Total number of opcodes defined.
    pub const COUNT: usize = 46;

    /// Get the opcode name as it appears in program listings.
    pub const fn name(self) -> &'static str {
        match self {
            Self::AnchoredDelay => "ANCHORED_DELAY",
            Self::CheckLitEarly => "CHECK_LIT_EARLY",
            Self::CheckGroups => "CHECK_GROUPS",
            Self::CheckOnlyEod => "CHECK_ONLY_EOD",
            Self::CheckBounds => "CHECK_BOUNDS",
            Self::CheckNotHandled => "CHECK_NOT_HANDLED",
            Self::CheckLookaround => "CHECK_LOOKAROUND",
            Self::CheckMask => "CHECK_MASK",
            Self::CheckMask32 => "CHECK_MASK_32",
            Self::CheckByte => "CHECK_BYTE",
            Self::CheckInfix => "CHECK_INFIX",
            Self::CheckPrefix => "CHECK_PREFIX",
            Self::PushDelayed => "PUSH_DELAYED",
            Self::RecordAnchored => "RECORD_ANCHORED",
            Self::CatchUp => "CATCH_UP",
            Self::CatchUpMpv => "CATCH_UP_MPV",
            Self::SomAdjust => "SOM_ADJUST",
            Self::SomLeftfix => "SOM_LEFTFIX",
            Self::SomFromReport => "SOM_FROM_REPORT",
            Self::SomZero => "SOM_ZERO",
            Self::TriggerInfix => "TRIGGER_INFIX",
            Self::TriggerSuffix => "TRIGGER_SUFFIX",
            Self::Dedupe => "DEDUPE",
            Self::DedupeSom => "DEDUPE_SOM",
            Self::ReportChain => "REPORT_CHAIN",
            Self::ReportSomInt => "REPORT_SOM_INT",
            Self::ReportSomAware => "REPORT_SOM_AWARE",
            Self::Report => "REPORT",
            Self::ReportExhaust => "REPORT_EXHAUST",
            Self::ReportSom => "REPORT_SOM",
            Self::ReportSomExhaust => "REPORT_SOM_EXHAUST",
            Self::DedupeAndReport => "DEDUPE_AND_REPORT",
            Self::FinalReport => "FINAL_REPORT",
            Self::CheckExhausted => "CHECK_EXHAUSTED",
            Self::CheckMinLength => "CHECK_MIN_LENGTH",
            Self::SetState => "SET_STATE",
            Self::SetGroups => "SET_GROUPS",
            Self::SquashGroups => "SQUASH_GROUPS",
            Self::CheckState => "CHECK_STATE",
            Self::SparseIterBegin => "SPARSE_ITER_BEGIN",
            Self::SparseIterNext => "SPARSE_ITER_NEXT",
            Self::SparseIterAny => "SPARSE_ITER_ANY",
            Self::EnginesEod => "ENGINES_EOD",
            Self::SuffixesEod => "SUFFIXES_EOD",
            Self::MatcherEod => "MATCHER_EOD",
            Self::End => "END",
        }
    }

    /// Try to convert a raw byte to an `Opcode`.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::AnchoredDelay),
            2 => Some(Self::CheckLitEarly),
            3 => Some(Self::CheckGroups),
            4 => Some(Self::CheckOnlyEod),
            5 => Some(Self::CheckBounds),
            6 => Some(Self::CheckNotHandled),
            7 => Some(Self::CheckLookaround),
            8 => Some(Self::CheckMask),
            9 => Some(Self::CheckMask32),
            10 => Some(Self::CheckByte),
            11 => Some(Self::CheckInfix),
            12 => Some(Self::CheckPrefix),
            13 => Some(Self::PushDelayed),
            14 => Some(Self::RecordAnchored),
            15 => Some(Self::CatchUp),
            16 => Some(Self::CatchUpMpv),
            17 => Some(Self::SomAdjust),
            18 => Some(Self::SomLeftfix),
            19 => Some(Self::SomFromReport),
            20 => Some(Self::SomZero),
            21 => Some(Self::TriggerInfix),
            22 => Some(Self::TriggerSuffix),
            23 => Some(Self::Dedupe),
            24 => Some(Self::DedupeSom),
            25 => Some(Self::ReportChain),
            26 => Some(Self::ReportSomInt),
            27 => Some(Self::ReportSomAware),
            28 => Some(Self::Report),
            29 => Some(Self::ReportExhaust),
            30 => Some(Self::ReportSom),
            31 => Some(Self::ReportSomExhaust),
            32 => Some(Self::DedupeAndReport),
            33 => Some(Self::FinalReport),
            34 => Some(Self::CheckExhausted),
            35 => Some(Self::CheckMinLength),
            36 => Some(Self::SetState),
            37 => Some(Self::SetGroups),
            38 => Some(Self::SquashGroups),
            39 => Some(Self::CheckState),
            40 => Some(Self::SparseIterBegin),
            41 => Some(Self::SparseIterNext),
            42 => Some(Self::SparseIterAny),
            43 => Some(Self::EnginesEod),
            44 => Some(Self::SuffixesEod),
            45 => Some(Self::MatcherEod),
            46 => Some(Self::End),
            _ => None,
        }
    }

    /// Packed record length in bytes for this opcode, opcode byte included.
    ///
    /// This is the occupied length; the assembler aligns the *next* record
    /// offset up to [`crate::INSTR_MIN_ALIGN`] and the gap is zero padding.
    pub const fn record_len(self) -> usize {
        match self {
            // code only
            Self::CatchUp
            | Self::CatchUpMpv
            | Self::SomZero
            | Self::SuffixesEod
            | Self::MatcherEod
            | Self::End => 1,
            // code + u32
            Self::CheckLitEarly
            | Self::CheckOnlyEod
            | Self::RecordAnchored
            | Self::SomAdjust
            | Self::SetState
            | Self::EnginesEod => 1 + 4,
            // code + u8 + u32
            Self::PushDelayed => 1 + 1 + 4,
            // code + u64
            Self::CheckGroups | Self::SetGroups | Self::SquashGroups => 1 + 8,
            // code + u32 + u32
            Self::SomLeftfix
            | Self::TriggerSuffix
            | Self::Report
            | Self::ReportSom
            | Self::CheckExhausted
            | Self::CheckState
            | Self::CheckNotHandled
            | Self::SparseIterAny => 1 + 4 + 4,
            // code + u8 + u32 + u32
            Self::TriggerInfix => 1 + 1 + 4 + 4,
            // code + u8 + u8 + u8 + i32 + target
            Self::CheckByte => 1 + 1 + 1 + 1 + 4 + 4,
            // code + u64 + target
            Self::AnchoredDelay => 1 + 8 + 4,
            // code + u32 + u64
            Self::ReportChain => 1 + 4 + 8,
            // code + u32 + u32 + u32
            Self::CheckLookaround
            | Self::ReportExhaust
            | Self::ReportSomExhaust
            | Self::FinalReport => 1 + 4 + 4 + 4,
            // code + u8 + u32 + i32 + target
            Self::Dedupe | Self::DedupeSom => 1 + 1 + 4 + 4 + 4,
            // code + u32 + u32 + u32 + u32
            Self::CheckInfix
            | Self::CheckPrefix
            | Self::CheckMinLength
            | Self::SparseIterBegin
            | Self::SparseIterNext => 1 + 4 + 4 + 4 + 4,
            // code + u8 + u32 + u32 + i32 + target
            Self::DedupeAndReport => 1 + 1 + 4 + 4 + 4 + 4,
            // code + u64 + u64 + target
            Self::CheckBounds => 1 + 8 + 8 + 4,
            // code + som operation
            Self::SomFromReport | Self::ReportSomInt | Self::ReportSomAware => {
                1 + SOM_OPERATION_LEN
            }
            // code + u64 * 3 + i32 + target
            Self::CheckMask => 1 + 8 + 8 + 8 + 4 + 4,
            // code + [u8;32] * 2 + u32 + i32 + target
            Self::CheckMask32 => 1 + 32 + 32 + 4 + 4 + 4,
        }
    }

    /// Whether any field of this opcode's record is a program-offset target.
    pub const fn has_target(self) -> bool {
        matches!(
            self,
            Self::AnchoredDelay
                | Self::CheckOnlyEod
                | Self::CheckBounds
                | Self::CheckNotHandled
                | Self::CheckLookaround
                | Self::CheckMask
                | Self::CheckMask32
                | Self::CheckByte
                | Self::CheckInfix
                | Self::CheckPrefix
                | Self::Dedupe
                | Self::DedupeSom
                | Self::DedupeAndReport
                | Self::CheckExhausted
                | Self::CheckMinLength
                | Self::CheckState
                | Self::SparseIterBegin
                | Self::SparseIterNext
                | Self::SparseIterAny
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{align_up, INSTR_MIN_ALIGN};
    use std::collections::HashSet;

    fn all_opcodes() -> Vec<Opcode> {
        (1..=46u8).map(|b| Opcode::from_byte(b).unwrap()).collect()
    }

    #[test]
    fn opcode_count() {
        assert_eq!(Opcode::COUNT, 46);
        assert_eq!(all_opcodes().len(), Opcode::COUNT);
    }

    #[test]
    fn opcode_from_byte_bounds() {
        assert_eq!(Opcode::from_byte(0), None);
        assert_eq!(Opcode::from_byte(1), Some(Opcode::AnchoredDelay));
        assert_eq!(Opcode::from_byte(46), Some(Opcode::End));
        assert_eq!(Opcode::from_byte(47), None);
        assert_eq!(Opcode::from_byte(255), None);
    }

    #[test]
    fn opcode_byte_roundtrip() {
        for op in all_opcodes() {
            assert_eq!(Opcode::from_byte(op as u8), Some(op));
        }
    }

    #[test]
    fn opcode_distinct_byte_values() {
        let mut seen = HashSet::new();
        for op in all_opcodes() {
            assert!(seen.insert(op as u8), "duplicate byte value for {op:?}");
        }
        assert_eq!(seen.len(), Opcode::COUNT);
    }

    #[test]
    fn opcode_name_spot_checks() {
        assert_eq!(Opcode::AnchoredDelay.name(), "ANCHORED_DELAY");
        assert_eq!(Opcode::CheckMask32.name(), "CHECK_MASK_32");
        assert_eq!(Opcode::SparseIterBegin.name(), "SPARSE_ITER_BEGIN");
        assert_eq!(Opcode::End.name(), "END");
    }

    #[test]
    fn opcode_display() {
        assert_eq!(Opcode::Report.to_string(), "REPORT");
        assert_eq!(Opcode::CatchUpMpv.to_string(), "CATCH_UP_MPV");
    }

    #[test]
    fn record_lengths_sane() {
        for op in all_opcodes() {
            let len = op.record_len();
            assert!(len >= 1, "{op:?} has empty record");
            assert!(
                len <= Opcode::CheckMask32.record_len(),
                "{op:?} larger than the largest known record"
            );
        }
        assert_eq!(Opcode::End.record_len(), 1);
        assert_eq!(Opcode::CheckBounds.record_len(), 21);
        assert_eq!(Opcode::CheckMask32.record_len(), 77);
        assert_eq!(align_up(Opcode::CheckMask32.record_len(), INSTR_MIN_ALIGN), 80);
    }

    #[test]
    fn has_target_spot_checks() {
        assert!(Opcode::CheckBounds.has_target());
        assert!(Opcode::SparseIterBegin.has_target());
        assert!(Opcode::DedupeAndReport.has_target());
        assert!(!Opcode::Report.has_target());
        assert!(!Opcode::SetGroups.has_target());
        assert!(!Opcode::End.has_target());
        assert!(!Opcode::EnginesEod.has_target());
    }
}
