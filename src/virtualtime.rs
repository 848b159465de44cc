//! Virtual-time values: symbolic aggregates materialized on demand
//! (`spec.md` §4.6, second paragraph).
//!
//! Concrete `VirtualSpec`s for the three aggregate kinds the spec names —
//! tuples, string slices, and method-object closures — plus the
//! `nested_weight` budget that forces materialization once virtual
//! nesting gets too deep across a call boundary.

use crate::entities::VinfoRef;
use crate::error::CompileError;
use crate::settings::Settings;
use crate::source::{MaterializeSink, NestedWeightKind, RunTimeSource, Source, VirtualSpec};
use crate::vinfo::VinfoGraph;
use log::trace;

/// Tracks how much nested-weight budget a chain of virtual values nested
/// inside one another has spent, forcing materialization once
/// `Settings::nested_weight_end` is reached (`spec.md` §4.6 "The
/// `nested_weight` budget prevents unbounded virtual nesting across
/// calls").
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedWeightBudget {
    spent: u16,
}

impl NestedWeightBudget {
    pub fn new() -> Self {
        NestedWeightBudget { spent: 0 }
    }

    /// Charge for nesting one more virtual value of the given spec inside
    /// the current chain. Returns `false` once the budget is exhausted,
    /// meaning the caller must materialize instead of nesting further.
    pub fn charge(&mut self, spec: &dyn VirtualSpec, kind: NestedWeightKind, settings: &Settings) -> bool {
        self.spent = self.spent.saturating_add(spec.nested_weight(kind) as u16);
        (self.spent as u32) < settings.nested_weight_end as u32
    }

    pub fn reset(&mut self) {
        self.spent = 0;
    }
}

/// Force `v` to a run-time representation if it is currently virtual;
/// a no-op otherwise (`spec.md` §4.6 "When any operation downstream
/// needs the concrete runtime representation, the virtual source's
/// `compute` callback is invoked").
pub fn materialize(
    graph: &mut VinfoGraph,
    v: VinfoRef,
    sink: &mut dyn MaterializeSink,
) -> Result<(), CompileError> {
    let spec = match &graph.get(v).source {
        Source::VirtualTime(vt) => vt.spec.clone(),
        _ => return Ok(()),
    };
    trace!("materializing virtual-time vinfo {v} ({})", spec.name());
    spec.compute(v, graph, sink)
}

/// A symbolic tuple: `fields` are the element vinfos, `len` is fixed at
/// construction (Python-style tuples are immutable, so no `Funcall`
/// weight penalty beyond the normal one).
#[derive(Debug)]
pub struct TupleSpec {
    pub len: usize,
}

impl VirtualSpec for TupleSpec {
    fn name(&self) -> &'static str {
        "tuple"
    }

    fn pyobject_mask(&self) -> u32 {
        if self.len >= 32 {
            u32::MAX
        } else {
            (1u32 << self.len) - 1
        }
    }

    fn nested_weight(&self, kind: NestedWeightKind) -> u8 {
        match kind {
            NestedWeightKind::Normal => 1,
            NestedWeightKind::Funcall => 2,
        }
    }

    fn compute(
        &self,
        this: VinfoRef,
        graph: &mut VinfoGraph,
        sink: &mut dyn MaterializeSink,
    ) -> Result<(), CompileError> {
        let rt = sink.emit_materialize(self.name())?;
        graph.get_mut(this).source = Source::RunTime(rt);
        Ok(())
    }
}

/// A symbolic slice of a host string, described by an offset/length pair
/// held in `this`'s sub-fields rather than on the spec itself (the spec
/// is shared, `'static` behavior; the offset and length vary per value).
#[derive(Debug)]
pub struct StringSliceSpec;

impl VirtualSpec for StringSliceSpec {
    fn name(&self) -> &'static str {
        "string_slice"
    }

    fn pyobject_mask(&self) -> u32 {
        0
    }

    fn nested_weight(&self, kind: NestedWeightKind) -> u8 {
        match kind {
            NestedWeightKind::Normal => 1,
            NestedWeightKind::Funcall => 3,
        }
    }

    fn compute(
        &self,
        this: VinfoRef,
        graph: &mut VinfoGraph,
        sink: &mut dyn MaterializeSink,
    ) -> Result<(), CompileError> {
        let rt = sink.emit_materialize(self.name())?;
        graph.get_mut(this).source = Source::RunTime(rt);
        Ok(())
    }
}

/// A symbolic bound-method closure (`instance`, `function`) pair, kept
/// virtual so a `obj.method(args)` call site never actually allocates the
/// intermediate bound-method object (`spec.md` §8 scenario 5's sibling
/// case for method calls rather than tuple unpacking).
#[derive(Debug)]
pub struct MethodClosureSpec;

impl VirtualSpec for MethodClosureSpec {
    fn name(&self) -> &'static str {
        "method_closure"
    }

    fn pyobject_mask(&self) -> u32 {
        0b11
    }

    fn nested_weight(&self, kind: NestedWeightKind) -> u8 {
        match kind {
            NestedWeightKind::Normal => 0,
            NestedWeightKind::Funcall => 4,
        }
    }

    fn compute(
        &self,
        this: VinfoRef,
        graph: &mut VinfoGraph,
        sink: &mut dyn MaterializeSink,
    ) -> Result<(), CompileError> {
        let rt = sink.emit_materialize(self.name())?;
        graph.get_mut(this).source = Source::RunTime(rt);
        Ok(())
    }
}
