//! Program IR and assembler for the Bramble matching engine compiler.
//!
//! The graph-to-program lowering builds [`Program`] values out of
//! [`Instruction`]s, deduplicates them with [`program_hash`] and
//! [`program_equivalent`], and hands the survivors to [`assemble`], which
//! emits packed, aligned bytecode plus side data in an [`EngineBlob`].
//! The scan-time interpreter that executes the bytecode lives elsewhere;
//! this crate fixes what the bytes look like, not what they do.

pub mod blob;
pub mod emit;
pub mod hash;
pub mod instr;
pub mod multibit;
pub mod program;

pub use blob::EngineBlob;
pub use emit::{assemble, layout, AssembledProgram, Layout, OffsetMap};
pub use hash::{hash_combine, program_equivalent, program_hash};
pub use instr::Instruction;
pub use program::{InstrId, Program};
