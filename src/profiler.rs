//! Profiler strategies that decide when a bytecode entry point is worth
//! specializing (`spec.md` §5 "Profiler statistics", §6 "Three selectable
//! profilers").
//!
//! Mirrors `cranelift_codegen`'s timing-counter module in shape: per-thread
//! counters avoid contention on the hot path, a shared totals table
//! (atomic adds) lets a host report aggregate stats across threads.

use crate::entities::BytecodeOffset;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which strategy decides whether the next call at a bytecode offset
/// should trigger compilation (`spec.md` §6 "Three selectable profilers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerKind {
    /// Samples on a fixed cadence of the host's tick counter; a hit marks
    /// the current offset as hot regardless of call count.
    SampleAtBytecodeTicks,
    /// Compiles on the very first call; no warm-up period.
    CompileOnCall,
    /// Never triggers a new compile; only runs already-compiled code and
    /// otherwise defers to the interpreter. Useful for benchmarking the
    /// interpreter baseline or for hosts that pre-populate code buffers
    /// out of band.
    RunIfCompiled,
}

/// The verdict a profiler reaches for one call at one offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not hot yet; run the interpreter.
    Interpret,
    /// Hot: compile (or recompile) starting here.
    Compile,
}

/// Shared, cross-thread totals. Every field is updated with a plain
/// atomic add; no lock is needed since these are monotonically
/// increasing counters, not a structure with cross-field invariants
/// (`spec.md` §5 "Profiler statistics: per-thread counters plus a shared
/// totals table; updates are atomic adds").
#[derive(Default)]
pub struct SharedTotals {
    calls: AtomicU64,
    ticks_sampled: AtomicU64,
    compiles_triggered: AtomicU64,
}

impl SharedTotals {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedTotals::default())
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn ticks_sampled(&self) -> u64 {
        self.ticks_sampled.load(Ordering::Relaxed)
    }

    pub fn compiles_triggered(&self) -> u64 {
        self.compiles_triggered.load(Ordering::Relaxed)
    }
}

/// Per-offset call/tick counters private to one thread. Kept separate
/// from `SharedTotals` so the hot path never contends with other
/// threads (`spec.md` §5 "Thread-local data").
#[derive(Default)]
struct LocalCounters {
    calls: u64,
    ticks: u64,
}

/// One thread's profiler state: a selected strategy plus its local
/// counters, keyed by bytecode offset. `Toggling is per-thread`
/// (`spec.md` §6), so `kind` is a plain field, not shared.
pub struct Profiler {
    kind: ProfilerKind,
    totals: Arc<SharedTotals>,
    local: RefCell<FxHashMap<BytecodeOffset, LocalCounters>>,
    /// Calls before `SampleAtBytecodeTicks` takes its next sample.
    sample_period: u64,
    /// Calls before `CompileOnCall` triggers (0 = immediately).
    compile_on_call_threshold: u64,
}

impl Profiler {
    pub fn new(kind: ProfilerKind, totals: Arc<SharedTotals>) -> Self {
        Profiler {
            kind,
            totals,
            local: RefCell::new(FxHashMap::default()),
            sample_period: 1000,
            compile_on_call_threshold: 0,
        }
    }

    /// Switch strategy on this thread only.
    pub fn set_kind(&mut self, kind: ProfilerKind) {
        self.kind = kind;
    }

    pub fn kind(&self) -> ProfilerKind {
        self.kind
    }

    /// Record one call at `offset` and return whether the site is now
    /// considered hot. `host_ticks` is whatever the host's tick counter
    /// reads at this call, used only by `SampleAtBytecodeTicks`
    /// (`spec.md` §6 "uses host's tick counter").
    pub fn record_call(&self, offset: BytecodeOffset, host_ticks: u64) -> Verdict {
        self.totals.calls.fetch_add(1, Ordering::Relaxed);
        match self.kind {
            ProfilerKind::RunIfCompiled => Verdict::Interpret,
            ProfilerKind::CompileOnCall => {
                let mut local = self.local.borrow_mut();
                let counters = local.entry(offset).or_default();
                counters.calls += 1;
                if counters.calls > self.compile_on_call_threshold {
                    self.totals.compiles_triggered.fetch_add(1, Ordering::Relaxed);
                    Verdict::Compile
                } else {
                    Verdict::Interpret
                }
            }
            ProfilerKind::SampleAtBytecodeTicks => {
                let mut local = self.local.borrow_mut();
                let counters = local.entry(offset).or_default();
                counters.calls += 1;
                counters.ticks = counters.ticks.wrapping_add(host_ticks);
                self.totals.ticks_sampled.fetch_add(1, Ordering::Relaxed);
                if counters.calls % self.sample_period == 0 {
                    self.totals.compiles_triggered.fetch_add(1, Ordering::Relaxed);
                    Verdict::Compile
                } else {
                    Verdict::Interpret
                }
            }
        }
    }

    pub fn local_calls(&self, offset: BytecodeOffset) -> u64 {
        self.local
            .borrow()
            .get(&offset)
            .map(|c| c.calls)
            .unwrap_or(0)
    }

    pub fn totals(&self) -> &SharedTotals {
        &self.totals
    }
}
