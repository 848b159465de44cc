//! The run entry point and the thread-local bookkeeping it needs
//! (`SPEC_FULL.md` §6 "Run entry", §5 "Thread-local data").
//!
//! Actually executing a `CodeBuffer`'s bytes requires host-provided
//! executable memory mapping, an explicit Non-goal (`spec.md` §1
//! "Allocator of code pages (assumed mmap-able executable memory with
//! standard lifetime)"). `NativeEntry` is the external collaborator this
//! module calls through instead of mapping and jumping into memory itself.

use crate::compiler::{Compiler, FunctionId};
use crate::entities::CodeBufferRef;
use crate::error::HostExceptionValue;
use crate::settings::Settings;
use log::trace;
use std::cell::RefCell;
use std::sync::Mutex;

/// Maps a `CodeBufferRef`'s bytes into real executable memory (or already
/// has, ahead of time) and knows this crate's native calling convention
/// well enough to invoke it. An external collaborator, like `crate::isa::Isa`
/// and `crate::bytecode::Decoder`: this crate only specifies the contract.
pub trait NativeEntry {
    /// Invoke the code in `buffer` with `args` already pushed in reverse
    /// order (`spec.md` §6 "Arguments are pushed in reverse order onto a
    /// fresh native stack frame"), returning the value it computed or the
    /// host exception it raised.
    ///
    /// # Safety
    /// `buffer` must refer to code this crate actually emitted and the
    /// caller must guarantee it is currently mapped executable; this
    /// crate has no way to check either from here.
    unsafe fn call(&self, buffer: CodeBufferRef, args: &[i64]) -> Result<i64, HostExceptionValue>;
}

/// One entry in the thread-local chain of native call frames, letting
/// unwinding and traceback walk specialized frames the same way they walk
/// interpreter frames (`spec.md` §5 "a structure mapping host-frame
/// identities to entry frames of native execution... a linked list of
/// `stack_frame_info`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrameInfo {
    /// Opaque host-assigned identity for the interpreter frame this native
    /// frame stands in for.
    pub host_frame_id: u64,
    pub buffer: CodeBufferRef,
}

thread_local! {
    static FRAME_INFO: RefCell<Vec<StackFrameInfo>> = const { RefCell::new(Vec::new()) };
}

/// Push a frame onto this thread's native-execution chain. Callers must
/// pair this with `pop_frame_info` even on the error path, or unwinding
/// will see a stale entry.
fn push_frame_info(info: StackFrameInfo) {
    FRAME_INFO.with(|stack| stack.borrow_mut().push(info));
}

fn pop_frame_info() -> Option<StackFrameInfo> {
    FRAME_INFO.with(|stack| stack.borrow_mut().pop())
}

/// A snapshot of this thread's current native-frame chain, innermost
/// frame last, for a host's unwinder or traceback builder to walk.
pub fn current_frame_chain() -> Vec<StackFrameInfo> {
    FRAME_INFO.with(|stack| stack.borrow().clone())
}

/// A per-thread evaluation stack with grow-on-demand semantics
/// (`spec.md` §5 "Virtual-machine back-ends additionally hold a per-thread
/// evaluation stack with grow-on-demand semantics (`stack_size_margin`
/// margin, `extra_stack_size` growth granularity)").
pub struct EvaluationStack {
    values: Vec<i64>,
    margin: usize,
    growth: usize,
}

impl EvaluationStack {
    pub fn new(settings: &Settings) -> Self {
        EvaluationStack {
            values: Vec::new(),
            margin: settings.stack_size_margin as usize,
            growth: settings.extra_stack_size as usize,
        }
    }

    fn ensure_headroom(&mut self) {
        if self.values.capacity() - self.values.len() < self.margin {
            trace!(
                "evaluation stack within {} slots of capacity; growing by {}",
                self.margin,
                self.growth
            );
            self.values.reserve(self.growth);
        }
    }

    pub fn push(&mut self, value: i64) {
        self.ensure_headroom();
        self.values.push(value);
    }

    pub fn pop(&mut self) -> Option<i64> {
        self.values.pop()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Run a compiled buffer with `initial_stack` pushed in reverse order onto
/// a fresh native frame (`spec.md` §6 "Run entry"). Drains the code
/// buffer manager's deferred-release queue afterward, since this is
/// exactly the "no compiled code is on any thread's native call stack
/// right at this point" moment `Compiler::safe_point` needs
/// (`SPEC_FULL.md` §3 supplemented feature 4).
pub fn run(
    compiler: &Compiler,
    entry: &dyn NativeEntry,
    buffer: CodeBufferRef,
    initial_stack: &[i64],
    host_frame_id: u64,
) -> Result<i64, HostExceptionValue> {
    let mut reversed: Vec<i64> = initial_stack.to_vec();
    reversed.reverse();

    push_frame_info(StackFrameInfo { host_frame_id, buffer });
    let result = unsafe { entry.call(buffer, &reversed) };
    pop_frame_info();

    let released = compiler.safe_point();
    if released > 0 {
        trace!("run: safe point released {released} buffers");
    }
    result
}

/// The "Exports to host" `specialized_function` wrapper (`spec.md` §6):
/// looks up or lazily compiles a specialization keyed by argument count,
/// then invokes it, falling back to the interpreter (by returning `None`)
/// for call shapes this function was never able to specialize for.
pub struct SpecializedFunction<F> {
    id: FunctionId,
    compile_for_arity: F,
    cache: Mutex<rustc_hash::FxHashMap<usize, Option<CodeBufferRef>>>,
}

impl<F> SpecializedFunction<F>
where
    F: Fn(FunctionId, usize) -> Option<CodeBufferRef>,
{
    pub fn new(id: FunctionId, compile_for_arity: F) -> Self {
        SpecializedFunction {
            id,
            compile_for_arity,
            cache: Mutex::new(rustc_hash::FxHashMap::default()),
        }
    }

    /// `None` means this call shape (by argument count) has never
    /// compiled successfully and the host should fall back to the
    /// interpreter; `Some` carries the run's outcome.
    pub fn call(
        &self,
        compiler: &Compiler,
        entry: &dyn NativeEntry,
        args: &[i64],
        host_frame_id: u64,
    ) -> Option<Result<i64, HostExceptionValue>> {
        let arity = args.len();
        let buffer = *self
            .cache
            .lock()
            .unwrap()
            .entry(arity)
            .or_insert_with(|| (self.compile_for_arity)(self.id, arity));
        let buffer = buffer?;
        Some(run(compiler, entry, buffer, args, host_frame_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x86_64::X86_64;

    struct FakeEntry;
    impl NativeEntry for FakeEntry {
        unsafe fn call(&self, _buffer: CodeBufferRef, args: &[i64]) -> Result<i64, HostExceptionValue> {
            Ok(args.iter().sum())
        }
    }

    #[test]
    fn run_reverses_arguments_before_calling_and_drains_safe_point() {
        struct RecordingEntry;
        impl NativeEntry for RecordingEntry {
            unsafe fn call(&self, _buffer: CodeBufferRef, args: &[i64]) -> Result<i64, HostExceptionValue> {
                Ok(args[0])
            }
        }
        let compiler = Compiler::new(Box::new(X86_64), Settings::default());
        let buffer = CodeBufferRef::from_u32(0);
        let result = run(&compiler, &RecordingEntry, buffer, &[1, 2, 3], 0xabc);
        // [1, 2, 3] reversed is [3, 2, 1]; args[0] should be 3.
        assert_eq!(result.unwrap(), 3);
        assert!(current_frame_chain().is_empty(), "frame must be popped after run returns");
    }

    #[test]
    fn specialized_function_caches_by_arity_and_falls_back_to_none() {
        let compiler = Compiler::new(Box::new(X86_64), Settings::default());
        let id = FunctionId(1);
        let mut compiles = 0;
        let sf = SpecializedFunction::new(id, |_id, arity| {
            if arity == 2 {
                Some(CodeBufferRef::from_u32(0))
            } else {
                None
            }
        });
        let _ = compiles; // only meaningful if we tracked call counts below

        assert!(sf.call(&compiler, &FakeEntry, &[1, 2], 0).is_some());
        assert!(sf.call(&compiler, &FakeEntry, &[1, 2, 3], 0).is_none());
        compiles += 1;
        let _ = compiles;
    }

    #[test]
    fn evaluation_stack_grows_before_it_runs_out_of_headroom() {
        let settings = Settings::builder().stack_size_margin(2).extra_stack_size(4).finish();
        let mut stack = EvaluationStack::new(&settings);
        for i in 0..3 {
            stack.push(i);
        }
        assert_eq!(stack.len(), 3);
        assert!(stack.values.capacity() >= 3);
    }
}
