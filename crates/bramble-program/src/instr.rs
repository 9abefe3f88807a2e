//! Program instructions.
//!
//! A single instruction is a tagged variant over the opcode catalogue.
//! Target fields hold [`InstrId`] handles into the owning program; they are
//! translated to absolute byte offsets when the record is written. Derived
//! equality (`==`) compares targets by handle and is only meaningful inside
//! one program; cross-program comparison goes through [`Instruction::equiv`],
//! which compares targets by the offsets they assemble to.

use bramble_error::{BrambleError, Result};
use bramble_types::{GroupMask, Opcode, ReportId, SomOperation};
use xxhash_rust::xxh3::xxh3_64;

use crate::blob::EngineBlob;
use crate::emit::{IterState, OffsetMap, SharedIter};
use crate::hash::hash_combine;
use crate::multibit;
use crate::program::InstrId;

/// One program instruction, payload per opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Fall through to `done` unless the match is anchored-delayed.
    AnchoredDelay { groups: GroupMask, done: InstrId },
    /// Check that the literal matched at or after `min_offset`.
    CheckLitEarly { min_offset: u32 },
    /// Check that at least one of `groups` is still on.
    CheckGroups { groups: GroupMask },
    /// Check that the match sits exactly at end of data.
    CheckOnlyEod { fail: InstrId },
    /// Check that the end offset lies inside `[min_bound, max_bound]`.
    CheckBounds {
        min_bound: u64,
        max_bound: u64,
        fail: InstrId,
    },
    /// Check that `key` has not already been handled at this offset.
    CheckNotHandled { key: u32, fail: InstrId },
    /// Check lookaround table entries `[index, index + count)`.
    CheckLookaround { index: u32, count: u32, fail: InstrId },
    /// Check up to eight bytes against and/compare masks.
    CheckMask {
        and_mask: u64,
        cmp_mask: u64,
        neg_mask: u64,
        offset: i32,
        fail: InstrId,
    },
    /// Check 32 bytes against inline mask vectors.
    CheckMask32 {
        and_mask: [u8; 32],
        cmp_mask: [u8; 32],
        neg_mask: u32,
        offset: i32,
        fail: InstrId,
    },
    /// Check a single byte against an and/compare mask.
    CheckByte {
        and_mask: u8,
        cmp_mask: u8,
        negation: u8,
        offset: i32,
        fail: InstrId,
    },
    /// Check that the infix engine on `queue` accepts `report` at `lag`.
    CheckInfix {
        queue: u32,
        lag: u32,
        report: ReportId,
        fail: InstrId,
    },
    /// Check that the prefix engine on `queue` accepts `report` at `lag`.
    CheckPrefix {
        queue: u32,
        lag: u32,
        report: ReportId,
        fail: InstrId,
    },
    /// Push a delayed-literal rebuild record.
    PushDelayed { delay: u8, index: u32 },
    /// Record an anchored literal match for the replay log.
    RecordAnchored { id: u32 },
    /// Catch outstanding engines up to the current offset.
    CatchUp,
    /// Catch the MPV engine up to the current offset.
    CatchUpMpv,
    /// Adjust start of match back by `distance`.
    SomAdjust { distance: u32 },
    /// Read start of match from the left-fix engine on `queue`.
    SomLeftfix { queue: u32, lag: u32 },
    /// Derive start of match from a SOM operation.
    SomFromReport { som: SomOperation },
    /// Set start of match to the current offset.
    SomZero,
    /// Fire top `event` into the infix engine on `queue`.
    TriggerInfix { cancel: u8, queue: u32, event: u32 },
    /// Fire top `event` into the suffix engine on `queue`.
    TriggerSuffix { queue: u32, event: u32 },
    /// Deduplicate an external report.
    Dedupe {
        quash_som: u8,
        dkey: u32,
        offset_adjust: i32,
        fail: InstrId,
    },
    /// Deduplicate a SOM-carrying external report.
    DedupeSom {
        quash_som: u8,
        dkey: u32,
        offset_adjust: i32,
        fail: InstrId,
    },
    /// Report a chained (MPV) internal event.
    ReportChain {
        event: u32,
        top_squash_distance: u64,
    },
    /// Write start of match to an internal SOM slot.
    ReportSomInt { som: SomOperation },
    /// Fire a SOM-aware internal report.
    ReportSomAware { som: SomOperation },
    /// Fire an external report callback.
    Report {
        onmatch: ReportId,
        offset_adjust: i32,
    },
    /// Fire an external report and set exhaustion key `ekey`.
    ReportExhaust {
        onmatch: ReportId,
        offset_adjust: i32,
        ekey: u32,
    },
    /// Fire an external report carrying start of match.
    ReportSom {
        onmatch: ReportId,
        offset_adjust: i32,
    },
    /// Fire a SOM report and set exhaustion key `ekey`.
    ReportSomExhaust {
        onmatch: ReportId,
        offset_adjust: i32,
        ekey: u32,
    },
    /// Fused dedupe-then-report.
    DedupeAndReport {
        quash_som: u8,
        dkey: u32,
        onmatch: ReportId,
        offset_adjust: i32,
        fail: InstrId,
    },
    /// Fire the last report of a program, then stop.
    FinalReport {
        onmatch: ReportId,
        offset_adjust: i32,
    },
    /// Check that `ekey` is not yet set.
    CheckExhausted { ekey: u32, fail: InstrId },
    /// Check that the match satisfies `min_length`.
    CheckMinLength {
        end_adj: i32,
        min_length: u64,
        fail: InstrId,
    },
    /// Switch on role state bit `index`.
    SetState { index: u32 },
    /// Turn `groups` on.
    SetGroups { groups: GroupMask },
    /// Turn `groups` off.
    SquashGroups { groups: GroupMask },
    /// Check that role state bit `index` is on.
    CheckState { index: u32, fail: InstrId },
    /// Begin iterating set role-state keys out of `num_keys`, dispatching
    /// through `jump_table` (ascending by key). The iterator bit-vector and
    /// jump table are written to the blob at emit time and shared with any
    /// later [`Instruction::SparseIterNext`] that refers back here.
    SparseIterBegin {
        num_keys: u32,
        jump_table: Vec<(u32, InstrId)>,
        fail: InstrId,
    },
    /// Resume a sparse iteration from state key `state`. `begin` must refer
    /// to the companion [`Instruction::SparseIterBegin`], which the program
    /// order places first.
    SparseIterNext {
        state: u32,
        begin: InstrId,
        fail: InstrId,
    },
    /// Check that any of `keys` (out of `num_keys`) is on.
    SparseIterAny {
        num_keys: u32,
        keys: Vec<u32>,
        fail: InstrId,
    },
    /// Run outstanding engines at end of data via the iterator at
    /// `iter_offset` in the blob (built by the engine-image serialiser).
    EnginesEod { iter_offset: u32 },
    /// Run suffix engines at end of data.
    SuffixesEod,
    /// Run the EOD literal matcher.
    MatcherEod,
    /// End of program.
    End,
}

impl Instruction {
    /// The opcode tag of this instruction.
    #[allow(clippy::too_many_lines)]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::AnchoredDelay { .. } => Opcode::AnchoredDelay,
            Self::CheckLitEarly { .. } => Opcode::CheckLitEarly,
            Self::CheckGroups { .. } => Opcode::CheckGroups,
            Self::CheckOnlyEod { .. } => Opcode::CheckOnlyEod,
            Self::CheckBounds { .. } => Opcode::CheckBounds,
            Self::CheckNotHandled { .. } => Opcode::CheckNotHandled,
            Self::CheckLookaround { .. } => Opcode::CheckLookaround,
            Self::CheckMask { .. } => Opcode::CheckMask,
            Self::CheckMask32 { .. } => Opcode::CheckMask32,
            Self::CheckByte { .. } => Opcode::CheckByte,
            Self::CheckInfix { .. } => Opcode::CheckInfix,
            Self::CheckPrefix { .. } => Opcode::CheckPrefix,
            Self::PushDelayed { .. } => Opcode::PushDelayed,
            Self::RecordAnchored { .. } => Opcode::RecordAnchored,
            Self::CatchUp => Opcode::CatchUp,
            Self::CatchUpMpv => Opcode::CatchUpMpv,
            Self::SomAdjust { .. } => Opcode::SomAdjust,
            Self::SomLeftfix { .. } => Opcode::SomLeftfix,
            Self::SomFromReport { .. } => Opcode::SomFromReport,
            Self::SomZero => Opcode::SomZero,
            Self::TriggerInfix { .. } => Opcode::TriggerInfix,
            Self::TriggerSuffix { .. } => Opcode::TriggerSuffix,
            Self::Dedupe { .. } => Opcode::Dedupe,
            Self::DedupeSom { .. } => Opcode::DedupeSom,
            Self::ReportChain { .. } => Opcode::ReportChain,
            Self::ReportSomInt { .. } => Opcode::ReportSomInt,
            Self::ReportSomAware { .. } => Opcode::ReportSomAware,
            Self::Report { .. } => Opcode::Report,
            Self::ReportExhaust { .. } => Opcode::ReportExhaust,
            Self::ReportSom { .. } => Opcode::ReportSom,
            Self::ReportSomExhaust { .. } => Opcode::ReportSomExhaust,
            Self::DedupeAndReport { .. } => Opcode::DedupeAndReport,
            Self::FinalReport { .. } => Opcode::FinalReport,
            Self::CheckExhausted { .. } => Opcode::CheckExhausted,
            Self::CheckMinLength { .. } => Opcode::CheckMinLength,
            Self::SetState { .. } => Opcode::SetState,
            Self::SetGroups { .. } => Opcode::SetGroups,
            Self::SquashGroups { .. } => Opcode::SquashGroups,
            Self::CheckState { .. } => Opcode::CheckState,
            Self::SparseIterBegin { .. } => Opcode::SparseIterBegin,
            Self::SparseIterNext { .. } => Opcode::SparseIterNext,
            Self::SparseIterAny { .. } => Opcode::SparseIterAny,
            Self::EnginesEod { .. } => Opcode::EnginesEod,
            Self::SuffixesEod => Opcode::SuffixesEod,
            Self::MatcherEod => Opcode::MatcherEod,
            Self::End => Opcode::End,
        }
    }

    /// Packed record length in bytes.
    #[must_use]
    pub const fn byte_length(&self) -> usize {
        self.opcode().record_len()
    }

    /// Structural hash over the opcode and all non-target payload fields.
    ///
    /// Targets are deliberately excluded: two instructions differing only
    /// in target identity hash identically, and the equivalence relation
    /// discriminates them by assembled offset instead.
    #[allow(clippy::too_many_lines)]
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut v = self.opcode() as u8 as u64;
        match self {
            Self::AnchoredDelay { groups, .. }
            | Self::CheckGroups { groups }
            | Self::SetGroups { groups }
            | Self::SquashGroups { groups } => hash_combine(&mut v, *groups),
            Self::CheckLitEarly { min_offset } => hash_combine(&mut v, u64::from(*min_offset)),
            Self::CheckBounds {
                min_bound,
                max_bound,
                ..
            } => {
                hash_combine(&mut v, *min_bound);
                hash_combine(&mut v, *max_bound);
            }
            Self::CheckNotHandled { key, .. } => hash_combine(&mut v, u64::from(*key)),
            Self::CheckLookaround { index, count, .. } => {
                hash_combine(&mut v, u64::from(*index));
                hash_combine(&mut v, u64::from(*count));
            }
            Self::CheckMask {
                and_mask,
                cmp_mask,
                neg_mask,
                offset,
                ..
            } => {
                hash_combine(&mut v, *and_mask);
                hash_combine(&mut v, *cmp_mask);
                hash_combine(&mut v, *neg_mask);
                hash_combine(&mut v, *offset as u64);
            }
            Self::CheckMask32 {
                and_mask,
                cmp_mask,
                neg_mask,
                offset,
                ..
            } => {
                hash_combine(&mut v, xxh3_64(and_mask));
                hash_combine(&mut v, xxh3_64(cmp_mask));
                hash_combine(&mut v, u64::from(*neg_mask));
                hash_combine(&mut v, *offset as u64);
            }
            Self::CheckByte {
                and_mask,
                cmp_mask,
                negation,
                offset,
                ..
            } => {
                hash_combine(&mut v, u64::from(*and_mask));
                hash_combine(&mut v, u64::from(*cmp_mask));
                hash_combine(&mut v, u64::from(*negation));
                hash_combine(&mut v, *offset as u64);
            }
            Self::CheckInfix {
                queue, lag, report, ..
            }
            | Self::CheckPrefix {
                queue, lag, report, ..
            } => {
                hash_combine(&mut v, u64::from(*queue));
                hash_combine(&mut v, u64::from(*lag));
                hash_combine(&mut v, u64::from(*report));
            }
            Self::PushDelayed { delay, index } => {
                hash_combine(&mut v, u64::from(*delay));
                hash_combine(&mut v, u64::from(*index));
            }
            Self::RecordAnchored { id } => hash_combine(&mut v, u64::from(*id)),
            Self::SomAdjust { distance } => hash_combine(&mut v, u64::from(*distance)),
            Self::SomLeftfix { queue, lag } => {
                hash_combine(&mut v, u64::from(*queue));
                hash_combine(&mut v, u64::from(*lag));
            }
            Self::SomFromReport { som }
            | Self::ReportSomInt { som }
            | Self::ReportSomAware { som } => {
                hash_combine(&mut v, u64::from(som.kind));
                hash_combine(&mut v, u64::from(som.onmatch));
                hash_combine(&mut v, som.aux as u64);
            }
            Self::TriggerInfix {
                cancel,
                queue,
                event,
            } => {
                hash_combine(&mut v, u64::from(*cancel));
                hash_combine(&mut v, u64::from(*queue));
                hash_combine(&mut v, u64::from(*event));
            }
            Self::TriggerSuffix { queue, event } => {
                hash_combine(&mut v, u64::from(*queue));
                hash_combine(&mut v, u64::from(*event));
            }
            Self::Dedupe {
                quash_som,
                dkey,
                offset_adjust,
                ..
            }
            | Self::DedupeSom {
                quash_som,
                dkey,
                offset_adjust,
                ..
            } => {
                hash_combine(&mut v, u64::from(*quash_som));
                hash_combine(&mut v, u64::from(*dkey));
                hash_combine(&mut v, *offset_adjust as u64);
            }
            Self::ReportChain {
                event,
                top_squash_distance,
            } => {
                hash_combine(&mut v, u64::from(*event));
                hash_combine(&mut v, *top_squash_distance);
            }
            Self::Report {
                onmatch,
                offset_adjust,
            }
            | Self::ReportSom {
                onmatch,
                offset_adjust,
            }
            | Self::FinalReport {
                onmatch,
                offset_adjust,
            } => {
                hash_combine(&mut v, u64::from(*onmatch));
                hash_combine(&mut v, *offset_adjust as u64);
            }
            Self::ReportExhaust {
                onmatch,
                offset_adjust,
                ekey,
            }
            | Self::ReportSomExhaust {
                onmatch,
                offset_adjust,
                ekey,
            } => {
                hash_combine(&mut v, u64::from(*onmatch));
                hash_combine(&mut v, *offset_adjust as u64);
                hash_combine(&mut v, u64::from(*ekey));
            }
            Self::DedupeAndReport {
                quash_som,
                dkey,
                onmatch,
                offset_adjust,
                ..
            } => {
                hash_combine(&mut v, u64::from(*quash_som));
                hash_combine(&mut v, u64::from(*dkey));
                hash_combine(&mut v, u64::from(*onmatch));
                hash_combine(&mut v, *offset_adjust as u64);
            }
            Self::CheckExhausted { ekey, .. } => hash_combine(&mut v, u64::from(*ekey)),
            Self::CheckMinLength {
                end_adj,
                min_length,
                ..
            } => {
                hash_combine(&mut v, *end_adj as u64);
                hash_combine(&mut v, *min_length);
            }
            Self::SetState { index } => hash_combine(&mut v, u64::from(*index)),
            Self::CheckState { index, .. } => hash_combine(&mut v, u64::from(*index)),
            Self::SparseIterBegin {
                num_keys,
                jump_table,
                ..
            } => {
                hash_combine(&mut v, u64::from(*num_keys));
                for &(key, _) in jump_table {
                    hash_combine(&mut v, u64::from(key));
                }
            }
            Self::SparseIterNext { state, .. } => hash_combine(&mut v, u64::from(*state)),
            Self::SparseIterAny { num_keys, keys, .. } => {
                hash_combine(&mut v, u64::from(*num_keys));
                for &key in keys {
                    hash_combine(&mut v, u64::from(key));
                }
            }
            Self::EnginesEod { iter_offset } => hash_combine(&mut v, u64::from(*iter_offset)),
            Self::CheckOnlyEod { .. }
            | Self::CatchUp
            | Self::CatchUpMpv
            | Self::SomZero
            | Self::SuffixesEod
            | Self::MatcherEod
            | Self::End => {}
        }
        v
    }

    /// Whether two instructions are equivalent within their own programs:
    /// same opcode, non-target fields bit-equal, and every target resolving
    /// to the same byte offset under the respective offset maps.
    #[allow(clippy::too_many_lines, clippy::similar_names)]
    #[must_use]
    pub fn equiv(&self, other: &Self, offsets: &OffsetMap, other_offsets: &OffsetMap) -> bool {
        let same = |a: InstrId, b: InstrId| offsets.at(a) == other_offsets.at(b);
        match (self, other) {
            (
                Self::AnchoredDelay { groups: g1, done: t1 },
                Self::AnchoredDelay { groups: g2, done: t2 },
            ) => g1 == g2 && same(*t1, *t2),
            (Self::CheckOnlyEod { fail: t1 }, Self::CheckOnlyEod { fail: t2 }) => same(*t1, *t2),
            (
                Self::CheckBounds {
                    min_bound: min1,
                    max_bound: max1,
                    fail: t1,
                },
                Self::CheckBounds {
                    min_bound: min2,
                    max_bound: max2,
                    fail: t2,
                },
            ) => min1 == min2 && max1 == max2 && same(*t1, *t2),
            (
                Self::CheckNotHandled { key: k1, fail: t1 },
                Self::CheckNotHandled { key: k2, fail: t2 },
            ) => k1 == k2 && same(*t1, *t2),
            (
                Self::CheckLookaround {
                    index: i1,
                    count: c1,
                    fail: t1,
                },
                Self::CheckLookaround {
                    index: i2,
                    count: c2,
                    fail: t2,
                },
            ) => i1 == i2 && c1 == c2 && same(*t1, *t2),
            (
                Self::CheckMask {
                    and_mask: a1,
                    cmp_mask: c1,
                    neg_mask: n1,
                    offset: o1,
                    fail: t1,
                },
                Self::CheckMask {
                    and_mask: a2,
                    cmp_mask: c2,
                    neg_mask: n2,
                    offset: o2,
                    fail: t2,
                },
            ) => a1 == a2 && c1 == c2 && n1 == n2 && o1 == o2 && same(*t1, *t2),
            (
                Self::CheckMask32 {
                    and_mask: a1,
                    cmp_mask: c1,
                    neg_mask: n1,
                    offset: o1,
                    fail: t1,
                },
                Self::CheckMask32 {
                    and_mask: a2,
                    cmp_mask: c2,
                    neg_mask: n2,
                    offset: o2,
                    fail: t2,
                },
            ) => a1 == a2 && c1 == c2 && n1 == n2 && o1 == o2 && same(*t1, *t2),
            (
                Self::CheckByte {
                    and_mask: a1,
                    cmp_mask: c1,
                    negation: n1,
                    offset: o1,
                    fail: t1,
                },
                Self::CheckByte {
                    and_mask: a2,
                    cmp_mask: c2,
                    negation: n2,
                    offset: o2,
                    fail: t2,
                },
            ) => a1 == a2 && c1 == c2 && n1 == n2 && o1 == o2 && same(*t1, *t2),
            (
                Self::CheckInfix {
                    queue: q1,
                    lag: l1,
                    report: r1,
                    fail: t1,
                },
                Self::CheckInfix {
                    queue: q2,
                    lag: l2,
                    report: r2,
                    fail: t2,
                },
            )
            | (
                Self::CheckPrefix {
                    queue: q1,
                    lag: l1,
                    report: r1,
                    fail: t1,
                },
                Self::CheckPrefix {
                    queue: q2,
                    lag: l2,
                    report: r2,
                    fail: t2,
                },
            ) => q1 == q2 && l1 == l2 && r1 == r2 && same(*t1, *t2),
            (
                Self::Dedupe {
                    quash_som: q1,
                    dkey: d1,
                    offset_adjust: o1,
                    fail: t1,
                },
                Self::Dedupe {
                    quash_som: q2,
                    dkey: d2,
                    offset_adjust: o2,
                    fail: t2,
                },
            )
            | (
                Self::DedupeSom {
                    quash_som: q1,
                    dkey: d1,
                    offset_adjust: o1,
                    fail: t1,
                },
                Self::DedupeSom {
                    quash_som: q2,
                    dkey: d2,
                    offset_adjust: o2,
                    fail: t2,
                },
            ) => q1 == q2 && d1 == d2 && o1 == o2 && same(*t1, *t2),
            (
                Self::DedupeAndReport {
                    quash_som: q1,
                    dkey: d1,
                    onmatch: m1,
                    offset_adjust: o1,
                    fail: t1,
                },
                Self::DedupeAndReport {
                    quash_som: q2,
                    dkey: d2,
                    onmatch: m2,
                    offset_adjust: o2,
                    fail: t2,
                },
            ) => q1 == q2 && d1 == d2 && m1 == m2 && o1 == o2 && same(*t1, *t2),
            (
                Self::CheckExhausted { ekey: e1, fail: t1 },
                Self::CheckExhausted { ekey: e2, fail: t2 },
            ) => e1 == e2 && same(*t1, *t2),
            (
                Self::CheckMinLength {
                    end_adj: e1,
                    min_length: m1,
                    fail: t1,
                },
                Self::CheckMinLength {
                    end_adj: e2,
                    min_length: m2,
                    fail: t2,
                },
            ) => e1 == e2 && m1 == m2 && same(*t1, *t2),
            (
                Self::CheckState { index: i1, fail: t1 },
                Self::CheckState { index: i2, fail: t2 },
            ) => i1 == i2 && same(*t1, *t2),
            (
                Self::SparseIterBegin {
                    num_keys: n1,
                    jump_table: j1,
                    fail: t1,
                },
                Self::SparseIterBegin {
                    num_keys: n2,
                    jump_table: j2,
                    fail: t2,
                },
            ) => {
                n1 == n2
                    && same(*t1, *t2)
                    && j1.len() == j2.len()
                    && j1
                        .iter()
                        .zip(j2.iter())
                        .all(|(&(k1, jt1), &(k2, jt2))| k1 == k2 && same(jt1, jt2))
            }
            (
                Self::SparseIterNext {
                    state: s1,
                    begin: b1,
                    fail: t1,
                },
                Self::SparseIterNext {
                    state: s2,
                    begin: b2,
                    fail: t2,
                },
            ) => s1 == s2 && same(*b1, *b2) && same(*t1, *t2),
            (
                Self::SparseIterAny {
                    num_keys: n1,
                    keys: k1,
                    fail: t1,
                },
                Self::SparseIterAny {
                    num_keys: n2,
                    keys: k2,
                    fail: t2,
                },
            ) => n1 == n2 && k1 == k2 && same(*t1, *t2),
            // No targets left: structural equality is field equality.
            (lhs, rhs) => lhs == rhs,
        }
    }

    /// Visit every target field.
    pub fn for_each_target(&self, mut f: impl FnMut(InstrId)) {
        match self {
            Self::AnchoredDelay { done, .. } => f(*done),
            Self::CheckOnlyEod { fail }
            | Self::CheckBounds { fail, .. }
            | Self::CheckNotHandled { fail, .. }
            | Self::CheckLookaround { fail, .. }
            | Self::CheckMask { fail, .. }
            | Self::CheckMask32 { fail, .. }
            | Self::CheckByte { fail, .. }
            | Self::CheckInfix { fail, .. }
            | Self::CheckPrefix { fail, .. }
            | Self::Dedupe { fail, .. }
            | Self::DedupeSom { fail, .. }
            | Self::DedupeAndReport { fail, .. }
            | Self::CheckExhausted { fail, .. }
            | Self::CheckMinLength { fail, .. }
            | Self::CheckState { fail, .. }
            | Self::SparseIterAny { fail, .. } => f(*fail),
            Self::SparseIterBegin {
                jump_table, fail, ..
            } => {
                f(*fail);
                for &(_, target) in jump_table {
                    f(target);
                }
            }
            Self::SparseIterNext { begin, fail, .. } => {
                f(*fail);
                f(*begin);
            }
            _ => {}
        }
    }

    /// Visit every target field mutably. This is the single place that
    /// knows which record slots are targets; rewriting and splice
    /// remapping both go through it.
    pub(crate) fn for_each_target_mut(&mut self, mut f: impl FnMut(&mut InstrId)) {
        match self {
            Self::AnchoredDelay { done, .. } => f(done),
            Self::CheckOnlyEod { fail }
            | Self::CheckBounds { fail, .. }
            | Self::CheckNotHandled { fail, .. }
            | Self::CheckLookaround { fail, .. }
            | Self::CheckMask { fail, .. }
            | Self::CheckMask32 { fail, .. }
            | Self::CheckByte { fail, .. }
            | Self::CheckInfix { fail, .. }
            | Self::CheckPrefix { fail, .. }
            | Self::Dedupe { fail, .. }
            | Self::DedupeSom { fail, .. }
            | Self::DedupeAndReport { fail, .. }
            | Self::CheckExhausted { fail, .. }
            | Self::CheckMinLength { fail, .. }
            | Self::CheckState { fail, .. }
            | Self::SparseIterAny { fail, .. } => f(fail),
            Self::SparseIterBegin {
                jump_table, fail, ..
            } => {
                f(fail);
                for (_, target) in jump_table {
                    f(target);
                }
            }
            Self::SparseIterNext { begin, fail, .. } => {
                f(fail);
                f(begin);
            }
            _ => {}
        }
    }

    /// Replace every target field equal to `old` with `new`. Instructions
    /// with no targets are no-ops.
    pub fn update_target(&mut self, old: InstrId, new: InstrId) {
        self.for_each_target_mut(|target| {
            if *target == old {
                *target = new;
            }
        });
    }

    /// Write the packed record into `dest` (exactly `byte_length()` bytes).
    /// Side payloads go to `blob`; target fields resolve through `offsets`.
    /// `id` is this instruction's handle, used to key sparse-iterator
    /// sharing state in `iters`.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn write(
        &self,
        id: InstrId,
        dest: &mut [u8],
        blob: &mut EngineBlob,
        offsets: &OffsetMap,
        iters: &mut IterState,
    ) -> Result<()> {
        debug_assert_eq!(dest.len(), self.byte_length());
        let opcode = self.opcode();
        let mut w = RecordWriter::new(dest);
        w.u8(opcode as u8);
        match self {
            Self::AnchoredDelay { groups, done } => {
                w.u64(*groups);
                w.u32(resolve(offsets, *done, opcode)?);
            }
            Self::CheckLitEarly { min_offset } => w.u32(*min_offset),
            Self::CheckGroups { groups }
            | Self::SetGroups { groups }
            | Self::SquashGroups { groups } => w.u64(*groups),
            Self::CheckOnlyEod { fail } => w.u32(resolve(offsets, *fail, opcode)?),
            Self::CheckBounds {
                min_bound,
                max_bound,
                fail,
            } => {
                w.u64(*min_bound);
                w.u64(*max_bound);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckNotHandled { key, fail } => {
                w.u32(*key);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckLookaround { index, count, fail } => {
                w.u32(*index);
                w.u32(*count);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckMask {
                and_mask,
                cmp_mask,
                neg_mask,
                offset,
                fail,
            } => {
                w.u64(*and_mask);
                w.u64(*cmp_mask);
                w.u64(*neg_mask);
                w.i32(*offset);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckMask32 {
                and_mask,
                cmp_mask,
                neg_mask,
                offset,
                fail,
            } => {
                w.bytes(and_mask);
                w.bytes(cmp_mask);
                w.u32(*neg_mask);
                w.i32(*offset);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckByte {
                and_mask,
                cmp_mask,
                negation,
                offset,
                fail,
            } => {
                w.u8(*and_mask);
                w.u8(*cmp_mask);
                w.u8(*negation);
                w.i32(*offset);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckInfix {
                queue,
                lag,
                report,
                fail,
            }
            | Self::CheckPrefix {
                queue,
                lag,
                report,
                fail,
            } => {
                w.u32(*queue);
                w.u32(*lag);
                w.u32(*report);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::PushDelayed { delay, index } => {
                w.u8(*delay);
                w.u32(*index);
            }
            Self::RecordAnchored { id } => w.u32(*id),
            Self::SomAdjust { distance } => w.u32(*distance),
            Self::SomLeftfix { queue, lag } => {
                w.u32(*queue);
                w.u32(*lag);
            }
            Self::SomFromReport { som }
            | Self::ReportSomInt { som }
            | Self::ReportSomAware { som } => w.som(som),
            Self::TriggerInfix {
                cancel,
                queue,
                event,
            } => {
                w.u8(*cancel);
                w.u32(*queue);
                w.u32(*event);
            }
            Self::TriggerSuffix { queue, event } => {
                w.u32(*queue);
                w.u32(*event);
            }
            Self::Dedupe {
                quash_som,
                dkey,
                offset_adjust,
                fail,
            }
            | Self::DedupeSom {
                quash_som,
                dkey,
                offset_adjust,
                fail,
            } => {
                w.u8(*quash_som);
                w.u32(*dkey);
                w.i32(*offset_adjust);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::ReportChain {
                event,
                top_squash_distance,
            } => {
                w.u32(*event);
                w.u64(*top_squash_distance);
            }
            Self::Report {
                onmatch,
                offset_adjust,
            }
            | Self::ReportSom {
                onmatch,
                offset_adjust,
            }
            | Self::FinalReport {
                onmatch,
                offset_adjust,
            } => {
                w.u32(*onmatch);
                w.i32(*offset_adjust);
            }
            Self::ReportExhaust {
                onmatch,
                offset_adjust,
                ekey,
            }
            | Self::ReportSomExhaust {
                onmatch,
                offset_adjust,
                ekey,
            } => {
                w.u32(*onmatch);
                w.i32(*offset_adjust);
                w.u32(*ekey);
            }
            Self::DedupeAndReport {
                quash_som,
                dkey,
                onmatch,
                offset_adjust,
                fail,
            } => {
                w.u8(*quash_som);
                w.u32(*dkey);
                w.u32(*onmatch);
                w.i32(*offset_adjust);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckExhausted { ekey, fail } => {
                w.u32(*ekey);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::CheckMinLength {
                end_adj,
                min_length,
                fail,
            } => {
                w.i32(*end_adj);
                w.u64(*min_length);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::SetState { index } => w.u32(*index),
            Self::CheckState { index, fail } => {
                w.u32(*index);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::SparseIterBegin {
                num_keys,
                jump_table,
                fail,
            } => {
                let shared = write_iter_payloads(blob, offsets, opcode, *num_keys, jump_table)?;
                let num_jumps = bramble_types::verify_u32("jump table length", jump_table.len())?;
                iters.record(id, shared);
                w.u32(shared.iter_offset);
                w.u32(shared.jump_table_offset);
                w.u32(num_jumps);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::SparseIterNext { state, begin, fail } => {
                let shared = iters.lookup(*begin)?;
                w.u32(shared.iter_offset);
                w.u32(shared.jump_table_offset);
                w.u32(*state);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::SparseIterAny {
                num_keys,
                keys,
                fail,
            } => {
                let iter = multibit::build_sparse_iter(*num_keys, keys)?;
                let iter_offset = blob.write(&iter, bramble_types::INSTR_MIN_ALIGN)?;
                w.u32(iter_offset);
                w.u32(resolve(offsets, *fail, opcode)?);
            }
            Self::EnginesEod { iter_offset } => w.u32(*iter_offset),
            Self::CatchUp
            | Self::CatchUpMpv
            | Self::SomZero
            | Self::SuffixesEod
            | Self::MatcherEod
            | Self::End => {}
        }
        w.finish();
        Ok(())
    }
}

/// Build and intern a sparse iterator plus its jump table, returning the
/// recorded blob offsets for sharing with companion NEXT instructions.
fn write_iter_payloads(
    blob: &mut EngineBlob,
    offsets: &OffsetMap,
    opcode: Opcode,
    num_keys: u32,
    jump_table: &[(u32, InstrId)],
) -> Result<SharedIter> {
    debug_assert!(
        jump_table.windows(2).all(|w| w[0].0 < w[1].0),
        "jump table keys must be strictly ascending"
    );

    let keys: Vec<u32> = jump_table.iter().map(|&(key, _)| key).collect();
    let iter = multibit::build_sparse_iter(num_keys, &keys)?;
    let iter_offset = blob.write(&iter, bramble_types::INSTR_MIN_ALIGN)?;

    let mut table = Vec::with_capacity(jump_table.len() * 8);
    for &(key, target) in jump_table {
        table.extend_from_slice(&key.to_le_bytes());
        table.extend_from_slice(&resolve(offsets, target, opcode)?.to_le_bytes());
    }
    let jump_table_offset = blob.write(&table, 4)?;

    Ok(SharedIter {
        iter_offset,
        jump_table_offset,
    })
}

fn resolve(offsets: &OffsetMap, target: InstrId, opcode: Opcode) -> Result<u32> {
    offsets.get(target).ok_or(BrambleError::DanglingTarget {
        opcode: opcode.name(),
    })
}

/// Sequential little-endian writer over one record's byte span.
struct RecordWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> RecordWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn i32(&mut self, v: i32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }

    fn som(&mut self, som: &SomOperation) {
        som.write_into(&mut self.buf[self.pos..self.pos + bramble_types::som::SOM_OPERATION_LEN]);
        self.pos += bramble_types::som::SOM_OPERATION_LEN;
    }

    fn finish(self) {
        debug_assert_eq!(self.pos, self.buf.len(), "record layout mismatch");
    }
}
