//! The three error channels of `spec.md` §7.

use crate::entities::{BytecodeOffset, VinfoRef};
use crate::promote::PromotionRequest;
use crate::source::Source;
use std::fmt;
use thiserror::Error;

/// Fatal conditions and host-exceptions-at-compile-time: the `Result` a
/// public compile entry point (`spec.md` §6) can fail with.
///
/// Ordinary "this function can't be specialized" outcomes are *not* errors
/// — they are `Ok(None)` per §6's contract that unsupported functions fall
/// back to the interpreter without fuss. `CompileError` is reserved for
/// conditions the caller cannot shrug off: we ran out of executable
/// memory, an invariant was violated (debug builds only — see
/// `InvariantViolation`'s doc), or a meta-op raised a host exception while
/// constant-folding at compile time.
#[derive(Error, Debug)]
pub enum CompileError {
    /// The code buffer manager could not grow: the host's executable-page
    /// allocator is exhausted. Surfaced through the host's memory-error
    /// mechanism per `spec.md` §7.3.
    #[error("out of executable memory while emitting code")]
    OutOfCodeMemory,

    /// A graph or compiler-state invariant was violated. In debug builds
    /// this aborts the process before reaching `CompileError` (`spec.md`
    /// §7.3); this variant exists for the release-build path, where the
    /// violation is instead logged and the enclosing function is
    /// defensively marked unsupported rather than returned as an error —
    /// callers should not normally observe this variant in release builds.
    #[error("compiler invariant violated: {0}")]
    InvariantViolation(String),

    /// A meta-operation raised a host-language exception while running at
    /// compile time (e.g. constant-folding `1 / 0`). Carries the symbolic
    /// exception type and value so the host can re-raise it with its own
    /// machinery.
    #[error("host exception raised at compile time")]
    HostException(HostExceptionValue),
}

/// Why `compile_code`/`compile_frame` declined to compile a function.
///
/// This is the internal detail behind the `None` the public API returns
/// (`spec.md` §6); kept as its own type so tests and logging can report
/// *why* a function didn't specialize without widening the public
/// `Option`-returning signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedReason {
    UnsupportedOpcode { offset: BytecodeOffset, opcode: String },
    IsGenerator,
    HasFreeOrCellVars,
    HasDoubleStarKwargs,
    RecursionLimitExceeded,
    RejectedByFilter,
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnsupportedReason::UnsupportedOpcode { offset, opcode } => {
                write!(f, "unsupported opcode {opcode:?} at {offset}")
            }
            UnsupportedReason::IsGenerator => write!(f, "function is a generator"),
            UnsupportedReason::HasFreeOrCellVars => {
                write!(f, "function has free or cell variables")
            }
            UnsupportedReason::HasDoubleStarKwargs => {
                write!(f, "function accepts **kwargs")
            }
            UnsupportedReason::RecursionLimitExceeded => {
                write!(f, "recursion limit reached while compiling")
            }
            UnsupportedReason::RejectedByFilter => {
                write!(f, "rejected by the host's code-object filter")
            }
        }
    }
}

/// The sum-typed control signal opcode handlers return instead of the
/// pseudo-exceptions the original throws through a C `setjmp`-like
/// convention (Design Note "Control-flow pseudo-exceptions").
///
/// `Compiler::dispatch` (see `crate::dispatch`) matches on this after every
/// handler call and drives the corresponding compiler-level action:
/// `Promote` suspends emission and installs a promotion stub; `Jump`
/// redirects dispatch to a bytecode offset other than the next one in
/// array order (a loop back-edge or a branch whose direction a handler
/// already resolved); `Return` / `Break` / `ContinueLoop` unwind to the
/// enclosing loop or function exit; `InlineIntoParent` hands control back
/// to an inlining caller; `HostException` either propagates further or is
/// caught by the nearest try-block recorded in `bytecode_private`.
#[derive(Debug)]
pub enum ControlSignal {
    /// Carry on to the next instruction normally.
    Continue,
    /// A handler needs a value promoted to compile-time before it can
    /// proceed; emission of the current path is suspended.
    Promote(PromotionRequest),
    /// Function-level return with the given value, referencing a node in
    /// the enclosing `CompilerState`'s `VinfoGraph`.
    Return(VinfoRef),
    /// Redirect dispatch to the instruction at this bytecode offset
    /// instead of the next one in array order: an unconditional jump, or
    /// a conditional branch whose direction a handler has already
    /// resolved (typically via `DispatchContext::runtime_condition`).
    /// The target must be a real instruction boundary.
    Jump(BytecodeOffset),
    /// `break` out of the innermost loop.
    Break,
    /// `continue` the innermost loop.
    ContinueLoop,
    /// Hand control back to an inlining parent compile.
    InlineIntoParent,
    /// A host-language exception was raised; `exc`/`value` are the
    /// symbolic exception type and value, matching the two-vinfo encoding
    /// from `spec.md` §7.2.
    HostException { exc: VinfoRef, value: VinfoRef },
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControlSignal::Continue => write!(f, "continue"),
            ControlSignal::Promote(req) => write!(f, "promote({:?})", req.flavor),
            ControlSignal::Return(_) => write!(f, "return"),
            ControlSignal::Jump(offset) => write!(f, "jump({offset})"),
            ControlSignal::Break => write!(f, "break"),
            ControlSignal::ContinueLoop => write!(f, "continue-loop"),
            ControlSignal::InlineIntoParent => write!(f, "inline-into-parent"),
            ControlSignal::HostException { .. } => write!(f, "host-exception"),
        }
    }
}

/// A host-language exception value observed while compiling, carried by
/// `CompileError::HostException`. The payload is intentionally opaque
/// sources rather than resolved host values — the host decides how to
/// surface `Source`/`Vinfo` payloads to its own users.
#[derive(Debug)]
pub struct HostExceptionValue {
    pub exc_source: Source,
    pub value_source: Source,
}

pub type CompileResult<T> = Result<T, CompileError>;
