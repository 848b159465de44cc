//! The bytecode decoder contract (`spec.md` §1 Non-goals: "Interpreter
//! semantics of the host language (assumed)"; §2 "the bytecode decoder...
//! are external collaborators; only their contracts with the core are
//! specified").
//!
//! `crate::mergepoints` and `crate::dispatch` drive any host bytecode
//! format through these two traits; this crate supplies no decoder of
//! its own.

use crate::entities::BytecodeOffset;

/// How an instruction affects control flow and merge-point placement
/// (`spec.md` §4.8 "classifying instructions by flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionClass {
    /// Cheap, straight-line; never forces a merge point by itself.
    Light,
    /// Unconditional transfer to `targets()[0]`.
    Jump,
    /// Conditional transfer; falls through or to `targets()[0]`.
    Branch,
    /// Behavior depends on external state not visible to the symbolic
    /// compiler (e.g. a global-variable load) and must be treated
    /// conservatively.
    ContextDependent,
    /// Legal only at module-definition scope (`spec.md` §4.8, flag
    /// `MODULE_ONLY`).
    ModuleOnly,
}

/// One decoded bytecode instruction.
pub trait Instruction {
    fn offset(&self) -> BytecodeOffset;
    fn class(&self) -> InstructionClass;
    /// Jump/branch targets, empty for anything else.
    fn targets(&self) -> &[BytecodeOffset];
    /// `true` for `yield`: `spec.md` §4.8 "Reject functions containing
    /// ... generators".
    fn is_generator_yield(&self) -> bool {
        false
    }
    /// Mnemonic for diagnostics (`UnsupportedReason::UnsupportedOpcode`).
    fn mnemonic(&self) -> &str;

    /// The local this instruction reads, if any, for the live-variable
    /// back-propagation pass (`spec.md` §4.8).
    fn reads_local(&self) -> Option<crate::entities::LocalIndex> {
        None
    }
    /// The local this instruction overwrites, if any. A write with no
    /// prior read makes the local dead immediately before this point.
    fn writes_local(&self) -> Option<crate::entities::LocalIndex> {
        None
    }
}

/// Decodes one bytecode object into a linear instruction stream.
///
/// Implementations own the host language's actual instruction set; this
/// crate only ever walks the stream they hand back.
pub trait Decoder {
    type Instr: Instruction;

    /// Decode the whole function, in increasing offset order.
    fn decode_all(&self) -> Vec<Self::Instr>;

    /// `true` if the function accepts `**kwargs` (`spec.md` §6
    /// precondition, `UnsupportedReason::HasDoubleStarKwargs`).
    fn has_double_star_kwargs(&self) -> bool;

    /// `true` if the function closes over or is closed over by an outer
    /// scope (`UnsupportedReason::HasFreeOrCellVars`).
    fn has_free_or_cell_vars(&self) -> bool;

    fn local_count(&self) -> u32;
}
