//! The program container.
//!
//! A program owns an ordered sequence of instructions, always terminated by
//! a single `END`. Instructions live in an arena and are referred to by
//! [`InstrId`] handles allocated monotonically; handles stay stable across
//! every mutation, which is what lets cross-references survive insertion
//! and splicing. Arena slots orphaned by `replace` or a consumed `END` are
//! never reused; only the order sequence defines the program.

use std::fmt::Write as _;

use crate::instr::Instruction;

/// Stable handle to an instruction inside one program. Only meaningful for
/// the program that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(u32);

impl InstrId {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// An ordered, owned list of instructions terminated by `END`.
#[derive(Debug)]
pub struct Program {
    /// Arena of owned instructions, one slot per allocated handle.
    arena: Vec<Instruction>,
    /// Program order. The last entry is always the `END`.
    order: Vec<InstrId>,
}

impl Program {
    /// Create a program containing only the terminating `END`.
    #[must_use]
    pub fn new() -> Self {
        let mut p = Self {
            arena: Vec::new(),
            order: Vec::new(),
        };
        let end = p.alloc(Instruction::End);
        p.order.push(end);
        p
    }

    /// Number of instructions, `END` included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the program contains only the `END`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        debug_assert!(!self.order.is_empty());
        self.order.len() == 1
    }

    /// Handle of the terminating `END` instruction. Forward branches that
    /// exit the program target this.
    #[must_use]
    pub fn end_id(&self) -> InstrId {
        let id = *self.order.last().expect("program always has an END");
        debug_assert!(matches!(self.arena[id.idx()], Instruction::End));
        id
    }

    /// Handle of the instruction at `pos` in program order.
    #[must_use]
    pub fn id_at(&self, pos: usize) -> InstrId {
        self.order[pos]
    }

    /// Look up an instruction by handle.
    #[must_use]
    pub fn get(&self, id: InstrId) -> &Instruction {
        &self.arena[id.idx()]
    }

    /// The first instruction.
    #[must_use]
    pub fn first(&self) -> &Instruction {
        self.get(self.order[0])
    }

    /// The last instruction (always `END`).
    #[must_use]
    pub fn back(&self) -> &Instruction {
        self.get(self.end_id())
    }

    /// Iterate instructions in program order.
    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.order.iter().map(move |id| &self.arena[id.idx()])
    }

    /// Iterate instructions in reverse program order.
    pub fn iter_rev(&self) -> impl Iterator<Item = &Instruction> {
        self.order.iter().rev().map(move |id| &self.arena[id.idx()])
    }

    /// Iterate `(handle, instruction)` pairs in program order.
    pub fn iter_ids(&self) -> impl Iterator<Item = (InstrId, &Instruction)> {
        self.order.iter().map(move |&id| (id, &self.arena[id.idx()]))
    }

    /// Arena slot count (upper bound on handle values), for offset maps.
    pub(crate) fn arena_len(&self) -> usize {
        self.arena.len()
    }

    fn alloc(&mut self, instr: Instruction) -> InstrId {
        let id = InstrId(u32::try_from(self.arena.len()).expect("program arena too large"));
        self.arena.push(instr);
        id
    }

    /// Every target of `instr` must resolve to an instruction currently in
    /// this program's order (the `END` included). Handles from another
    /// program, or handles orphaned by `replace`, are caller bugs.
    fn assert_owns_targets(&self, instr: &Instruction) {
        instr.for_each_target(|target| {
            assert!(
                self.order.contains(&target),
                "{} target does not reside in this program",
                instr.opcode().name()
            );
        });
    }

    /// Rewrite every target equal to `old` across the whole program. This
    /// sweep is the only mechanism by which cross-references move.
    fn rewrite_targets(&mut self, old: InstrId, new: InstrId) {
        debug_assert_ne!(old, new);
        for &id in &self.order {
            self.arena[id.idx()].update_target(old, new);
        }
    }

    /// Insert a single instruction before `pos` and return its handle.
    ///
    /// Targets inside the inserted instruction must already point into this
    /// program; callers arranging forward references insert the referent
    /// first or use block insertion.
    ///
    /// # Panics
    ///
    /// Panics if `pos` would place the instruction after the `END`, or if
    /// any target does not reside in this program.
    pub fn insert(&mut self, pos: usize, instr: Instruction) -> InstrId {
        assert!(pos < self.order.len(), "cannot insert past the END");
        self.assert_owns_targets(&instr);
        let id = self.alloc(instr);
        self.order.insert(pos, id);
        id
    }

    /// Splice `block` into this program before `pos`, consuming it.
    ///
    /// The block's trailing `END` is dropped; targets inside the block that
    /// pointed at it are rewritten to the instruction currently at `pos`.
    /// All other targets must be internal to the block and are carried over
    /// through fresh handles.
    ///
    /// # Panics
    ///
    /// Panics if `pos` would place the block after the `END`, or if a
    /// spliced instruction targets something outside the block.
    pub fn insert_block(&mut self, pos: usize, mut block: Program) {
        assert!(pos < self.order.len(), "cannot insert past the END");
        if block.is_empty() {
            return;
        }

        let block_end = block.end_id();
        let successor = self.order[pos];

        let mut remap: Vec<Option<InstrId>> = vec![None; block.arena.len()];
        let mut moved = Vec::with_capacity(block.order.len() - 1);
        for &old_id in &block.order[..block.order.len() - 1] {
            let instr = std::mem::replace(&mut block.arena[old_id.idx()], Instruction::End);
            let new_id = self.alloc(instr);
            remap[old_id.idx()] = Some(new_id);
            moved.push(new_id);
        }

        for &new_id in &moved {
            self.arena[new_id.idx()].for_each_target_mut(|target| {
                *target = if *target == block_end {
                    successor
                } else {
                    remap[target.idx()].expect("spliced target does not belong to the block")
                };
            });
        }

        self.order.splice(pos..pos, moved);
    }

    /// Add an instruction just before the terminating `END`.
    pub fn add_before_end(&mut self, instr: Instruction) -> InstrId {
        self.insert(self.order.len() - 1, instr)
    }

    /// Splice a block just before the terminating `END`.
    pub fn add_block_before_end(&mut self, block: Program) {
        self.insert_block(self.order.len() - 1, block);
    }

    /// Append `block`, replacing the current `END`.
    ///
    /// Targets that pointed at the old `END` are rewritten to the block's
    /// first instruction; the block's own `END` becomes the terminator.
    pub fn add_block(&mut self, mut block: Program) {
        if block.is_empty() {
            return;
        }

        let mut remap: Vec<Option<InstrId>> = vec![None; block.arena.len()];
        let mut moved = Vec::with_capacity(block.order.len());
        for &old_id in &block.order {
            let instr = std::mem::replace(&mut block.arena[old_id.idx()], Instruction::End);
            let new_id = self.alloc(instr);
            remap[old_id.idx()] = Some(new_id);
            moved.push(new_id);
        }
        for &new_id in &moved {
            self.arena[new_id.idx()].for_each_target_mut(|target| {
                *target = remap[target.idx()].expect("appended target does not belong to the block");
            });
        }

        let old_end = self.order.pop().expect("program always has an END");
        debug_assert!(matches!(self.arena[old_end.idx()], Instruction::End));
        let first_new = moved[0];
        self.rewrite_targets(old_end, first_new);
        self.order.extend(moved);
        debug_assert!(matches!(self.back(), Instruction::End));
    }

    /// Replace the instruction at `pos`, rewriting every reference to the
    /// old instruction to the new one. Returns the new handle.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is out of range, if any target does not reside in
    /// this program, or if replacing the terminator with something other
    /// than `END`.
    pub fn replace(&mut self, pos: usize, instr: Instruction) -> InstrId {
        assert!(pos < self.order.len(), "replace position out of range");
        self.assert_owns_targets(&instr);
        let old_id = self.order[pos];
        let new_id = self.alloc(instr);
        self.order[pos] = new_id;
        self.rewrite_targets(old_id, new_id);
        assert!(
            matches!(self.back(), Instruction::End),
            "replace must preserve the END terminator"
        );
        new_id
    }

    /// Insert without target validation. Assembly-side structural checks
    /// (dangling targets, duplicate handles) are unreachable through the
    /// validated mutation API; tests use this to exercise them.
    #[cfg(test)]
    pub(crate) fn insert_unvalidated(&mut self, pos: usize, instr: Instruction) -> InstrId {
        assert!(pos < self.order.len(), "cannot insert past the END");
        let id = self.alloc(instr);
        self.order.insert(pos, id);
        id
    }

    /// Render a human-readable listing, one instruction per line.
    ///
    /// Handles print as `InstrId(n)`; offsets only exist after assembly.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(self.order.len() * 48);
        for (pos, instr) in self.iter().enumerate() {
            writeln!(out, "{pos:>4}  {instr:?}").expect("write to string");
        }
        out
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}
