//! Opaque entity references used throughout the compiler.
//!
//! Vinfos, code buffers, merge points and stack/register slots are all
//! referenced indirectly through small `u32`-wrapping handles rather than
//! through pointers or `Rc`: this keeps the compiler state `Copy`-friendly
//! and lets graphs of shared sub-structure live in one arena each, indexed
//! by handle. See `cranelift_entity::EntityRef` for the trait these
//! implement.

use cranelift_entity::entity_impl;
use std::fmt;

/// A reference to a `Vinfo` stored in a `Compiler`'s vinfo arena.
///
/// This is the core currency of the symbolic compiler: every field of
/// `CompilerState`, every snapshot, every promotion stub records `VinfoRef`s
/// rather than owning `Vinfo` values directly.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VinfoRef(u32);
entity_impl!(VinfoRef, "vinfo");

/// A reference to a `CodeBuffer` owned by the code buffer manager.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeBufferRef(u32);
entity_impl!(CodeBufferRef, "cb");

/// A reference to a `MergePoint` in a function's merge-point table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergePointRef(u32);
entity_impl!(MergePointRef, "mp");

/// A reference to a compiled `Snapshot` owned by a merge point entry.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotRef(u32);
entity_impl!(SnapshotRef, "snap");

/// A reference to a coding-pause proxy awaiting its first real entry
/// (`crate::respawn`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyRef(u32);
entity_impl!(ProxyRef, "proxy");

/// A reference to a locally-numbered variable slot (locals + eval stack).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalIndex(u32);
entity_impl!(LocalIndex, "local");

/// A byte offset into a bytecode object's instruction stream.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BytecodeOffset(pub u32);

impl fmt::Display for BytecodeOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bc+{}", self.0)
    }
}

/// A physical machine register, opaque to the core but meaningful to an
/// `Isa` implementation. Architectures with more than 65536 registers are
/// not supported; none exist.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct RegId(pub u16);

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A byte offset on the native stack, relative to the compiler's fixed
/// anchor (see `CompilerState::stack_depth`). Limited to 26 bits so it can
/// be packed alongside flags in the `Source::RunTime` representation; see
/// `Settings::runtime_stack_max`.
pub type StackOffset = u32;

/// The maximum `StackOffset` representable in the packed run-time source
/// encoding used for debug assertions (`vinfo.rs`); actual enforcement of
/// the configured bound happens against `Settings::runtime_stack_max`.
pub const RUNTIME_STACK_MASK: u32 = (1 << 26) - 1;
