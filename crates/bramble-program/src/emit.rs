//! Two-pass program assembly.
//!
//! Pass 1 (`layout`) walks the program in order and assigns each
//! instruction an aligned byte offset; pass 2 (`assemble`) emits packed
//! records into a zero-filled buffer, resolving targets through the offset
//! map and appending side data to the engine blob. Two passes are
//! required: forward targets must be known before the records that refer
//! to them are serialised.

use std::collections::HashMap;

use bramble_error::{BrambleError, Result};
use bramble_types::{INSTR_MIN_ALIGN, MAX_PROGRAM_LEN};
use tracing::debug;

use crate::blob::EngineBlob;
use crate::program::{InstrId, Program};

/// Byte offsets of a program's instructions, keyed by handle.
#[derive(Debug)]
pub struct OffsetMap {
    offsets: Vec<Option<u32>>,
}

impl OffsetMap {
    fn with_capacity(slots: usize) -> Self {
        Self {
            offsets: vec![None; slots],
        }
    }

    /// Record an offset; returns false if the handle already has one
    /// (the same instruction appearing twice in the program order).
    fn record(&mut self, id: InstrId, offset: u32) -> bool {
        let slot = &mut self.offsets[id.idx()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(offset);
        true
    }

    /// The offset assigned to `id`, or `None` if the instruction is not in
    /// the laid-out program (a dangling target).
    #[must_use]
    pub fn get(&self, id: InstrId) -> Option<u32> {
        self.offsets.get(id.idx()).copied().flatten()
    }

    /// The offset assigned to `id`.
    ///
    /// # Panics
    ///
    /// Panics on a dangling target; use [`OffsetMap::get`] where dangling
    /// targets are reportable.
    #[must_use]
    pub fn at(&self, id: InstrId) -> u32 {
        self.get(id).expect("target not laid out in this program")
    }
}

/// Result of the layout pass: offsets plus the aligned total length.
#[derive(Debug)]
pub struct Layout {
    pub offsets: OffsetMap,
    pub total_len: u32,
}

/// Assign aligned byte offsets to every instruction (pass 1). No bytes are
/// emitted; equivalence checking runs this pass alone.
///
/// # Errors
///
/// `DuplicateInstruction` if the same handle appears twice in program
/// order; `ProgramTooLarge` if the laid-out size leaves the
/// `u32`-addressable range.
#[allow(clippy::cast_possible_truncation)]
pub fn layout(program: &Program) -> Result<Layout> {
    let align = INSTR_MIN_ALIGN as u64;
    let mut offsets = OffsetMap::with_capacity(program.arena_len());
    let mut total: u64 = 0;

    for (id, instr) in program.iter_ids() {
        let offset = (total + align - 1) & !(align - 1);
        let end = offset + instr.byte_length() as u64;
        if end > MAX_PROGRAM_LEN {
            return Err(BrambleError::ProgramTooLarge {
                len: end,
                max: MAX_PROGRAM_LEN,
            });
        }
        if !offsets.record(id, offset as u32) {
            return Err(BrambleError::DuplicateInstruction {
                opcode: instr.opcode().name(),
            });
        }
        total = end;
    }

    let total = (total + align - 1) & !(align - 1);
    if total > MAX_PROGRAM_LEN {
        return Err(BrambleError::ProgramTooLarge {
            len: total,
            max: MAX_PROGRAM_LEN,
        });
    }
    Ok(Layout {
        offsets,
        total_len: total as u32,
    })
}

/// Blob offsets recorded when a `SPARSE_ITER_BEGIN` emits, reused by its
/// companion `SPARSE_ITER_NEXT` records.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SharedIter {
    pub iter_offset: u32,
    pub jump_table_offset: u32,
}

/// Assembler-owned sparse-iterator sharing state. Living here rather than
/// on the instruction keeps the IR free of emission state, so equivalence
/// can never observe it.
#[derive(Debug, Default)]
pub(crate) struct IterState {
    shared: HashMap<InstrId, SharedIter>,
}

impl IterState {
    pub(crate) fn record(&mut self, begin: InstrId, shared: SharedIter) {
        let prev = self.shared.insert(begin, shared);
        debug_assert!(prev.is_none(), "SPARSE_ITER_BEGIN emitted twice");
    }

    pub(crate) fn lookup(&self, begin: InstrId) -> Result<SharedIter> {
        self.shared
            .get(&begin)
            .copied()
            .ok_or(BrambleError::IterNextBeforeBegin)
    }
}

/// An assembled program: packed bytecode and its total length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledProgram {
    /// The packed records. Record offsets inside this buffer are multiples
    /// of [`INSTR_MIN_ALIGN`]; gaps between records are zero.
    pub bytes: Vec<u8>,
    /// Number of bytes written (always `bytes.len()`).
    pub total_len: u32,
}

/// Lay out and emit `program`, appending side data to `blob` (pass 1 + 2).
///
/// # Errors
///
/// Structural errors (dangling target, NEXT before BEGIN, duplicate
/// instruction), resource errors (program or blob over capacity), and
/// range errors from scalar narrowing all abort assembly.
pub fn assemble(program: &Program, blob: &mut EngineBlob) -> Result<AssembledProgram> {
    let lay = layout(program)?;
    let mut bytes = vec![0u8; lay.total_len as usize];
    let mut iters = IterState::default();

    for (id, instr) in program.iter_ids() {
        let offset = lay.offsets.at(id) as usize;
        let len = instr.byte_length();
        instr.write(id, &mut bytes[offset..offset + len], blob, &lay.offsets, &mut iters)?;
    }

    debug!(
        instructions = program.len(),
        total_len = lay.total_len,
        "assembled program"
    );
    Ok(AssembledProgram {
        bytes,
        total_len: lay.total_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{program_equivalent, program_hash};
    use crate::instr::Instruction;
    use crate::multibit::SPARSE_ITER_HEADER_LEN;
    use bramble_types::Opcode;

    fn report(onmatch: u32, offset_adjust: i32) -> Instruction {
        Instruction::Report {
            onmatch,
            offset_adjust,
        }
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn minimal_program() {
        // An empty program assembles to a single END record, zeroed except
        // for the opcode byte.
        let p = Program::new();
        assert_eq!(p.len(), 1);
        assert!(p.is_empty());

        let mut blob = EngineBlob::new();
        let out = assemble(&p, &mut blob).unwrap();
        assert_eq!(out.total_len, INSTR_MIN_ALIGN as u32);
        assert_eq!(out.bytes.len(), INSTR_MIN_ALIGN);
        assert_eq!(out.bytes[0], Opcode::End as u8);
        assert!(out.bytes[1..].iter().all(|&b| b == 0));
        assert!(blob.is_empty());
    }

    #[test]
    fn report_record_fields() {
        let mut p = Program::new();
        p.add_before_end(report(42, -1));

        let out = assemble(&p, &mut EngineBlob::new()).unwrap();
        // REPORT is 9 bytes, padded to 16; END is 1 byte, padded to 8.
        assert_eq!(out.total_len, 24);
        assert_eq!(out.bytes[0], Opcode::Report as u8);
        assert_eq!(read_u32(&out.bytes, 1), 42);
        assert_eq!(&out.bytes[5..9], &(-1i32).to_le_bytes());
        assert!(out.bytes[9..16].iter().all(|&b| b == 0));
        assert_eq!(out.bytes[16], Opcode::End as u8);
    }

    #[test]
    fn branch_to_end_encodes_end_offset() {
        let mut p = Program::new();
        let end = p.end_id();
        p.add_before_end(Instruction::CheckBounds {
            min_bound: 10,
            max_bound: 100,
            fail: end,
        });

        let out = assemble(&p, &mut EngineBlob::new()).unwrap();
        // CHECK_BOUNDS is 21 bytes, so END lands at offset 24.
        assert_eq!(out.bytes[0], Opcode::CheckBounds as u8);
        assert_eq!(u64::from_le_bytes(out.bytes[1..9].try_into().unwrap()), 10);
        assert_eq!(u64::from_le_bytes(out.bytes[9..17].try_into().unwrap()), 100);
        assert_eq!(read_u32(&out.bytes, 17), 24);
        assert_eq!(out.bytes[24], Opcode::End as u8);
        assert_eq!(out.total_len, 32);
    }

    #[test]
    fn equivalent_programs_assemble_identically() {
        let build = || {
            let mut p = Program::new();
            let end = p.end_id();
            p.add_before_end(Instruction::CheckOnlyEod { fail: end });
            p
        };
        let p = build();
        let q = build();

        assert!(program_equivalent(&p, &q));
        assert_eq!(program_hash(&p), program_hash(&q));

        let mut blob = EngineBlob::new();
        let pa = assemble(&p, &mut blob).unwrap();
        let qa = assemble(&q, &mut blob).unwrap();
        assert_eq!(pa.bytes, qa.bytes);
    }

    #[test]
    fn inequivalent_when_targets_diverge() {
        // Same instruction multiset, but one check branches to END and the
        // other to the report: the offsets differ, so the programs must not
        // collapse together.
        let mut p = Program::new();
        let p_end = p.end_id();
        p.add_before_end(report(1, 0));
        p.insert(
            0,
            Instruction::CheckExhausted {
                ekey: 9,
                fail: p_end,
            },
        );

        let mut q = Program::new();
        let q_report = q.add_before_end(report(1, 0));
        q.insert(
            0,
            Instruction::CheckExhausted {
                ekey: 9,
                fail: q_report,
            },
        );

        assert!(!program_equivalent(&p, &q));
        // Hashes ignore targets, so these still collide; only equivalence
        // separates them.
        assert_eq!(program_hash(&p), program_hash(&q));
    }

    #[test]
    fn sparse_iter_next_shares_begin_payloads() {
        let mut p = Program::new();
        let end = p.end_id();
        let t1 = p.add_before_end(Instruction::SetState { index: 1 });
        let t2 = p.add_before_end(Instruction::SetState { index: 2 });
        let begin = p.insert(
            0,
            Instruction::SparseIterBegin {
                num_keys: 8,
                jump_table: vec![(3, t1), (7, t2)],
                fail: end,
            },
        );
        p.add_before_end(Instruction::SparseIterNext {
            state: 7,
            begin,
            fail: end,
        });

        let mut blob = EngineBlob::new();
        let out = assemble(&p, &mut blob).unwrap();

        // Order: BEGIN@0, SET_STATE@24, SET_STATE@32, NEXT@40, END@64.
        let begin_iter = read_u32(&out.bytes, 1);
        let begin_jumps = read_u32(&out.bytes, 5);
        assert_eq!(read_u32(&out.bytes, 9), 2); // declared jump count
        assert_eq!(read_u32(&out.bytes, 13), 64); // fail -> END

        let next_iter = read_u32(&out.bytes, 41);
        let next_jumps = read_u32(&out.bytes, 45);
        assert_eq!(read_u32(&out.bytes, 49), 7); // state
        assert_eq!(read_u32(&out.bytes, 53), 64); // fail -> END

        assert_eq!(begin_iter, next_iter);
        assert_eq!(begin_jumps, next_jumps);

        // Exactly one iterator payload and one jump table in the blob.
        let iter_len = SPARSE_ITER_HEADER_LEN + 8;
        assert_eq!(blob.len(), iter_len + 16);
        let jt = &blob.as_bytes()[begin_jumps as usize..begin_jumps as usize + 16];
        assert_eq!(read_u32(jt, 0), 3);
        assert_eq!(read_u32(jt, 4), 24); // t1's program offset
        assert_eq!(read_u32(jt, 8), 7);
        assert_eq!(read_u32(jt, 12), 32); // t2's program offset
    }

    #[test]
    fn iter_next_before_begin_is_rejected() {
        let mut p = Program::new();
        let end = p.end_id();
        let begin = p.add_before_end(Instruction::SparseIterBegin {
            num_keys: 4,
            jump_table: vec![],
            fail: end,
        });
        p.insert(
            0,
            Instruction::SparseIterNext {
                state: 0,
                begin,
                fail: end,
            },
        );

        let err = assemble(&p, &mut EngineBlob::new()).unwrap_err();
        assert!(matches!(err, BrambleError::IterNextBeforeBegin));
    }

    #[test]
    fn dangling_target_is_reported_with_opcode() {
        let mut p = Program::new();
        let victim = p.add_before_end(report(1, 0));
        // Replacing orphans the old instruction; a reference to it is
        // dangling. The validated mutation API rejects this at insert, so
        // reach the assembler's own check through the test-only hatch.
        p.replace(0, report(2, 0));
        let pos = p.len() - 1;
        p.insert_unvalidated(
            pos,
            Instruction::CheckExhausted {
                ekey: 0,
                fail: victim,
            },
        );

        let err = assemble(&p, &mut EngineBlob::new()).unwrap_err();
        assert!(matches!(
            err,
            BrambleError::DanglingTarget {
                opcode: "CHECK_EXHAUSTED"
            }
        ));
    }

    #[test]
    fn mask32_record_layout() {
        let mut p = Program::new();
        let end = p.end_id();
        let mut and_mask = [0u8; 32];
        let mut cmp_mask = [0u8; 32];
        and_mask[0] = 0x0f;
        and_mask[31] = 0xf0;
        cmp_mask[7] = 0x55;
        p.add_before_end(Instruction::CheckMask32 {
            and_mask,
            cmp_mask,
            neg_mask: 0xdead_beef,
            offset: -4,
            fail: end,
        });

        let out = assemble(&p, &mut EngineBlob::new()).unwrap();
        assert_eq!(out.bytes[0], Opcode::CheckMask32 as u8);
        assert_eq!(&out.bytes[1..33], &and_mask);
        assert_eq!(&out.bytes[33..65], &cmp_mask);
        assert_eq!(read_u32(&out.bytes, 65), 0xdead_beef);
        assert_eq!(&out.bytes[69..73], &(-4i32).to_le_bytes());
        assert_eq!(read_u32(&out.bytes, 73), 80); // fail -> END at 80
        assert_eq!(out.total_len, 88);
    }

    #[test]
    fn records_are_aligned_and_gaps_zeroed() {
        let mut p = Program::new();
        let end = p.end_id();
        p.add_before_end(Instruction::CheckLitEarly { min_offset: 3 });
        p.add_before_end(Instruction::CheckBounds {
            min_bound: 1,
            max_bound: 2,
            fail: end,
        });
        p.add_before_end(Instruction::CatchUp);
        p.add_before_end(report(5, 0));

        let lay = layout(&p).unwrap();
        let out = assemble(&p, &mut EngineBlob::new()).unwrap();

        let mut spans: Vec<(usize, usize)> = p
            .iter_ids()
            .map(|(id, instr)| (lay.offsets.at(id) as usize, instr.byte_length()))
            .collect();
        spans.sort_unstable();

        for (offset, len) in &spans {
            assert_eq!(offset % INSTR_MIN_ALIGN, 0);
            let next = spans
                .iter()
                .map(|&(o, _)| o)
                .find(|&o| o > *offset)
                .unwrap_or(out.bytes.len());
            assert!(
                out.bytes[offset + len..next].iter().all(|&b| b == 0),
                "non-zero padding after record at {offset}"
            );
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::hash::{program_equivalent, program_hash};
    use crate::instr::Instruction;
    use proptest::prelude::*;

    /// Construction recipe for one instruction; targets always resolve to
    /// the program's END so recipes can be replayed into fresh programs.
    #[derive(Debug, Clone)]
    enum Step {
        Report { onmatch: u32, offset_adjust: i32 },
        Bounds { min: u64, max: u64 },
        Groups { groups: u64 },
        Byte { and: u8, cmp: u8, neg: u8, offset: i32 },
        CatchUp,
    }

    fn arb_step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (any::<u32>(), any::<i32>())
                .prop_map(|(onmatch, offset_adjust)| Step::Report {
                    onmatch,
                    offset_adjust
                }),
            (any::<u64>(), any::<u64>()).prop_map(|(min, max)| Step::Bounds { min, max }),
            any::<u64>().prop_map(|groups| Step::Groups { groups }),
            (any::<u8>(), any::<u8>(), any::<u8>(), any::<i32>())
                .prop_map(|(and, cmp, neg, offset)| Step::Byte {
                    and,
                    cmp,
                    neg,
                    offset
                }),
            Just(Step::CatchUp),
        ]
    }

    fn build(steps: &[Step]) -> Program {
        let mut p = Program::new();
        let end = p.end_id();
        for step in steps {
            let instr = match *step {
                Step::Report {
                    onmatch,
                    offset_adjust,
                } => Instruction::Report {
                    onmatch,
                    offset_adjust,
                },
                Step::Bounds { min, max } => Instruction::CheckBounds {
                    min_bound: min,
                    max_bound: max,
                    fail: end,
                },
                Step::Groups { groups } => Instruction::SetGroups { groups },
                Step::Byte {
                    and,
                    cmp,
                    neg,
                    offset,
                } => Instruction::CheckByte {
                    and_mask: and,
                    cmp_mask: cmp,
                    negation: neg,
                    offset,
                    fail: end,
                },
                Step::CatchUp => Instruction::CatchUp,
            };
            p.add_before_end(instr);
        }
        p
    }

    proptest! {
        #[test]
        fn prop_hash_is_stable(steps in proptest::collection::vec(arb_step(), 0..32)) {
            let p = build(&steps);
            prop_assert_eq!(program_hash(&p), program_hash(&p));
        }

        #[test]
        fn prop_equivalence_implies_hash_and_bytes(
            steps in proptest::collection::vec(arb_step(), 0..32),
        ) {
            let p = build(&steps);
            let q = build(&steps);
            prop_assert!(program_equivalent(&p, &q));
            prop_assert_eq!(program_hash(&p), program_hash(&q));

            let mut blob = EngineBlob::new();
            let pa = assemble(&p, &mut blob).unwrap();
            let qa = assemble(&q, &mut blob).unwrap();
            prop_assert_eq!(pa.bytes, qa.bytes);
        }

        #[test]
        fn prop_layout_is_aligned(steps in proptest::collection::vec(arb_step(), 0..32)) {
            let p = build(&steps);
            let lay = layout(&p).unwrap();
            for (id, _) in p.iter_ids() {
                prop_assert_eq!(lay.offsets.at(id) as usize % INSTR_MIN_ALIGN, 0);
            }
            prop_assert_eq!(lay.total_len as usize % INSTR_MIN_ALIGN, 0);
        }

        #[test]
        fn prop_target_slots_encode_end_offset(
            steps in proptest::collection::vec(arb_step(), 1..32),
        ) {
            let p = build(&steps);
            let lay = layout(&p).unwrap();
            let end_offset = lay.offsets.at(p.end_id());
            let out = assemble(&p, &mut EngineBlob::new()).unwrap();

            for (id, instr) in p.iter_ids() {
                let base = lay.offsets.at(id) as usize;
                let slot = match instr {
                    Instruction::CheckBounds { .. } => Some(base + 17),
                    Instruction::CheckByte { .. } => Some(base + 8),
                    _ => None,
                };
                if let Some(at) = slot {
                    let got = u32::from_le_bytes(out.bytes[at..at + 4].try_into().unwrap());
                    prop_assert_eq!(got, end_offset);
                }
            }
        }
    }
}
