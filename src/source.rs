//! The source lattice (`spec.md` §4.1).
//!
//! A `Source` says where one symbolic value currently lives: on the native
//! stack and/or in a register with unknown bits (`RunTime`), folded into a
//! concrete bit pattern the compiler already knows (`CompileTime`), or
//! represented only symbolically, with materialization deferred to a
//! `VirtualSpec::compute` callback (`VirtualTime`).
//!
//! The original packs all three variants into the low bits of a machine
//! word (`vcompiler.h`'s `Source` typedef). Packing is a hot-path
//! implementation artifact there; here it is an ordinary tagged enum, per
//! Design Note "Source-language flavor as tagged variants".

use crate::entities::{RegId, VinfoRef};
use crate::error::CompileError;
use crate::vinfo::VinfoGraph;
use std::fmt;
use std::sync::Arc;

/// Where a symbolic value lives, and what the compiler is allowed to
/// assume about it.
#[derive(Clone, Debug)]
pub enum Source {
    /// The value's bits are unknown to the compiler; it lives at a native
    /// stack offset and/or in a register.
    RunTime(RunTimeSource),
    /// The value's exact bit pattern is known at compile time.
    CompileTime(CompileTimeSource),
    /// The value is symbolic; it has never been materialized into native
    /// data, and downstream consumers must call `compute` to force it.
    VirtualTime(VirtualTimeSource),
}

/// A run-time-resident value's location and bookkeeping flags.
///
/// Mirrors the `RunTime_*` bit-twiddling macros in `vcompiler.h`, but as
/// plain fields: `stack_offset`/`register` are independently optional,
/// `has_ref` tracks whether the compiler still owes a refcount decrement on
/// this value, `non_neg` is a narrowing flag set once a handler has proven
/// the value can't be negative, and `megamorphic` marks a site that gave up
/// on further specialization (see `crate::promote`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunTimeSource {
    /// Offset from the compiler's fixed stack anchor, or `None` if the
    /// value is not currently spilled anywhere.
    pub stack_offset: Option<u32>,
    /// The register currently holding the value, if any.
    pub register: Option<RegId>,
    /// `true` if the compiler is currently responsible for one refcount
    /// decrement on this value when it is released.
    pub has_ref: bool,
    /// `true` once proven non-negative; allows cheaper comparisons/checks
    /// downstream.
    pub non_neg: bool,
    /// `true` once a promotion site has given up on specializing further
    /// and is running its generic fallback.
    pub megamorphic: bool,
}

impl RunTimeSource {
    /// A fresh run-time value with no known location yet and no owed
    /// reference, matching `SOURCE_DUMMY` in the original.
    pub fn dummy() -> Self {
        RunTimeSource {
            stack_offset: None,
            register: None,
            has_ref: false,
            non_neg: false,
            megamorphic: false,
        }
    }

    /// A fresh run-time value that owes a reference, matching
    /// `SOURCE_DUMMY_WITH_REF`.
    pub fn dummy_with_ref() -> Self {
        RunTimeSource {
            has_ref: true,
            ..Self::dummy()
        }
    }

    /// Construct a value known to live in `register`.
    pub fn in_register(register: RegId, has_ref: bool, non_neg: bool) -> Self {
        RunTimeSource {
            stack_offset: None,
            register: Some(register),
            has_ref,
            non_neg,
            megamorphic: false,
        }
    }

    /// Construct a value known to live at `stack_offset`.
    pub fn on_stack(stack_offset: u32, has_ref: bool, non_neg: bool) -> Self {
        RunTimeSource {
            stack_offset: Some(stack_offset),
            register: None,
            has_ref,
            non_neg,
            megamorphic: false,
        }
    }

    /// `true` if this source has neither a register nor a stack slot bound
    /// yet (a freshly-minted placeholder).
    pub fn is_unbound(&self) -> bool {
        self.stack_offset.is_none() && self.register.is_none()
    }
}

/// A concrete, compile-time-known value, shared by refcount the way
/// `source_known_t` is in the original (`sk_incref`/`sk_decref`).
///
/// `Fixed` means a specialization's very identity depends on this exact
/// value — equality of `Fixed` values is what `compat.rs` uses to decide
/// whether a compile-time match is exact or merely compatible-with-diff.
/// `HostObject` means the bits are a host-heap pointer whose refcount the
/// compiler must honor; such known values are deliberately leaked rather
/// than freed, because emitted machine code may have embedded the pointer
/// as an immediate (Design Note, Open Question (b)).
#[derive(Clone, Debug)]
pub struct CompileTimeSource {
    pub known: Arc<Known>,
}

impl CompileTimeSource {
    pub fn new(known: Known) -> Self {
        CompileTimeSource {
            known: Arc::new(known),
        }
    }

    /// Wrap an already-interned known value, as `crate::compiler`'s
    /// process-wide known-value pool hands out (`spec.md` §5 "Known-value
    /// pool: shared refcounted; no removal; growth by allocation").
    pub fn from_interned(known: Arc<Known>) -> Self {
        CompileTimeSource { known }
    }

    /// Two compile-time sources are the `vinfo_known_equal` the original
    /// computes: trivially equal when they share the `Arc`, otherwise equal
    /// when the underlying concrete values compare equal.
    pub fn value_equals(&self, other: &CompileTimeSource) -> bool {
        Arc::ptr_eq(&self.known, &other.known) || self.known.value == other.known.value
    }
}

/// A concrete bit pattern known at compile time, plus the flags that
/// describe what kind of constant it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Known {
    /// The concrete payload: either a plain integer or a tagged host-heap
    /// pointer (when `is_host_object` is set).
    pub value: i64,
    /// Set when `value` is a tagged host-object pointer rather than a
    /// plain integer; such knowns must be refcounted and are the ones
    /// promotion installs (`PromotionFlavor::HostObject*`).
    pub is_host_object: bool,
    /// Set when code emitted under this specialization depends on `value`
    /// being exactly this; un-promotion (see `crate::unify`) clears it.
    pub fixed: bool,
}

impl Known {
    pub fn integer(value: i64) -> Self {
        Known {
            value,
            is_host_object: false,
            fixed: true,
        }
    }

    pub fn host_object(pointer: i64) -> Self {
        Known {
            value: pointer,
            is_host_object: true,
            fixed: true,
        }
    }

    /// A copy of `self` with the `fixed` flag cleared, as un-promotion
    /// produces conceptually (though un-promotion actually discards the
    /// compile-time source entirely in favor of a fresh run-time one; this
    /// helper exists for `compat.rs`'s "snapshot value is not Fixed" case).
    pub fn not_fixed(mut self) -> Self {
        self.fixed = false;
        self
    }
}

/// Behavior record carried by every virtual-time source
/// (`source_virtual_t` in the original).
///
/// A `VirtualSpec` is a `'static` behavioral descriptor, not data: the
/// symbolic payload of a particular virtual-time value lives in the
/// owning `Vinfo`'s `fields` array, keyed by whatever scheme the
/// `VirtualSpec` documents (e.g. "field 0 is the tuple length, fields 1..N
/// are the elements").
pub trait VirtualSpec: Send + Sync + fmt::Debug {
    /// A human-readable name, used in logs and `Display` impls.
    fn name(&self) -> &'static str;

    /// Bit `i` is set if sub-field `i` is a host-object reference, for
    /// refcount bookkeeping when the aggregate materializes or escapes.
    fn pyobject_mask(&self) -> u32;

    /// The nested-weight budget charged when this kind of virtual value is
    /// nested inside another, indexed by `NestedWeightKind`. A chain of
    /// nestings whose weights sum to `nested_weight_end` or more is forced
    /// to materialize rather than nest further (see `crate::virtualtime`).
    fn nested_weight(&self, kind: NestedWeightKind) -> u8;

    /// Force this virtual value into a real run-time representation:
    /// emit the allocation/construction code, then overwrite `this`'s
    /// source in place with the resulting `RunTimeSource` (`spec.md` §4.6
    /// "the `compute` callback is invoked; it emits allocation/
    /// construction code and rewrites the vinfo's source in place to
    /// runtime"). Implementations read their symbolic payload out of
    /// `this`'s sub-fields via `graph`.
    fn compute(
        &self,
        this: VinfoRef,
        graph: &mut VinfoGraph,
        sink: &mut dyn MaterializeSink,
    ) -> Result<(), CompileError>;
}

/// Emits the code a `VirtualSpec::compute` needs to actually build its
/// runtime representation, keeping `source.rs` free of ISA/code-buffer
/// concerns the same way `crate::vinfo::RefcountSink` does for decrefs.
pub trait MaterializeSink {
    /// Emit whatever construction sequence materializes `spec_name`'s
    /// aggregate, returning the fresh run-time location it now lives at.
    fn emit_materialize(&mut self, spec_name: &str) -> Result<RunTimeSource, CompileError>;
}

/// Which nested-weight budget applies to a virtual value's nesting depth.
///
/// Mutable aggregates are charged more heavily across a call boundary
/// (`Funcall`) than within the same function (`Normal`), matching
/// `NWI_NORMAL`/`NWI_FUNCALL` in the original.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NestedWeightKind {
    Normal,
    Funcall,
}

/// A virtual-time source: a `VirtualSpec` plus whatever raw, not-yet-typed
/// payload the spec's `compute`/`direct` implementations need that doesn't
/// fit in the owning vinfo's `fields` array (most specs need none).
#[derive(Clone)]
pub struct VirtualTimeSource {
    pub spec: Arc<dyn VirtualSpec>,
}

impl fmt::Debug for VirtualTimeSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtualTimeSource({})", self.spec.name())
    }
}

impl Source {
    /// The three-valued time class of this source, per the GLOSSARY.
    pub fn time_class(&self) -> TimeClass {
        match self {
            Source::RunTime(_) => TimeClass::RunTime,
            Source::CompileTime(_) => TimeClass::CompileTime,
            Source::VirtualTime(_) => TimeClass::VirtualTime,
        }
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, Source::RunTime(_))
    }

    pub fn is_compiletime(&self) -> bool {
        matches!(self, Source::CompileTime(_))
    }

    pub fn is_virtualtime(&self) -> bool {
        matches!(self, Source::VirtualTime(_))
    }

    pub fn as_runtime(&self) -> Option<&RunTimeSource> {
        match self {
            Source::RunTime(rt) => Some(rt),
            _ => None,
        }
    }

    pub fn as_runtime_mut(&mut self) -> Option<&mut RunTimeSource> {
        match self {
            Source::RunTime(rt) => Some(rt),
            _ => None,
        }
    }

    pub fn as_compiletime(&self) -> Option<&CompileTimeSource> {
        match self {
            Source::CompileTime(ct) => Some(ct),
            _ => None,
        }
    }

    pub fn as_virtualtime(&self) -> Option<&VirtualTimeSource> {
        match self {
            Source::VirtualTime(vt) => Some(vt),
            _ => None,
        }
    }

    /// `true` if the core currently owes a refcount decrement for this
    /// value (`has_rtref` in the original). Only run-time sources can owe
    /// a reference directly; compile-time host-object knowns are
    /// deliberately leaked (Open Question (b)) and virtual-time values owe
    /// nothing until materialized.
    pub fn has_ref(&self) -> bool {
        matches!(self, Source::RunTime(rt) if rt.has_ref)
    }

    /// Bind a previously-unbound run-time source to a stack offset.
    /// Panics (via `debug_assert!`) if this isn't a run-time source or if
    /// it already has a stack offset, matching the original's
    /// `set_rtstack_to` precondition.
    pub fn bind_stack_offset(&mut self, offset: u32) {
        if let Source::RunTime(rt) = self {
            debug_assert!(rt.stack_offset.is_none());
            rt.stack_offset = Some(offset);
        } else {
            debug_assert!(false, "bind_stack_offset on non-runtime source");
        }
    }

    /// Bind (or rebind) a run-time source's register.
    pub fn bind_register(&mut self, reg: Option<RegId>) {
        if let Source::RunTime(rt) = self {
            rt.register = reg;
        } else {
            debug_assert!(false, "bind_register on non-runtime source");
        }
    }

    /// Clear `has_ref`. Callers must either have just emitted a decrement
    /// or transferred the reference elsewhere; see `crate::vinfo::decref`.
    pub fn clear_ref(&mut self) {
        if let Source::RunTime(rt) = self {
            rt.has_ref = false;
        }
    }

    /// Set `has_ref`. Per the contract in `spec.md` §4.1, this may only be
    /// called on a freshly-minted run-time value.
    pub fn set_ref(&mut self, has_ref: bool) {
        if let Source::RunTime(rt) = self {
            rt.has_ref = has_ref;
        }
    }

    pub fn set_non_neg(&mut self) {
        if let Source::RunTime(rt) = self {
            rt.non_neg = true;
        }
    }

    /// Is this source known, at compile time, to be non-negative? Mirrors
    /// `is_nonneg` in the original: run-time values need the narrowing
    /// flag, compile-time integers are checked directly, virtual-time
    /// values are conservatively unknown.
    pub fn is_non_neg(&self) -> bool {
        match self {
            Source::RunTime(rt) => rt.non_neg,
            Source::CompileTime(ct) => !ct.known.is_host_object && ct.known.value >= 0,
            Source::VirtualTime(_) => false,
        }
    }
}

/// The three-valued time class of a `Source`, independent of payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeClass {
    RunTime,
    CompileTime,
    VirtualTime,
}

impl fmt::Display for TimeClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TimeClass::RunTime => "run-time",
            TimeClass::CompileTime => "compile-time",
            TimeClass::VirtualTime => "virtual-time",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_has_no_location() {
        let s = RunTimeSource::dummy();
        assert!(s.is_unbound());
        assert!(!s.has_ref);
    }

    #[test]
    fn dummy_with_ref_owes_a_decrement() {
        let s = RunTimeSource::dummy_with_ref();
        assert!(s.has_ref);
    }

    #[test]
    fn fixed_integers_compare_by_value() {
        let a = CompileTimeSource::new(Known::integer(42));
        let b = CompileTimeSource::new(Known::integer(42));
        assert!(a.value_equals(&b));
        let c = CompileTimeSource::new(Known::integer(43));
        assert!(!a.value_equals(&c));
    }

    #[test]
    fn shared_known_is_equal_to_itself() {
        let k = CompileTimeSource::new(Known::integer(7));
        let k2 = k.clone();
        assert!(k.value_equals(&k2));
    }

    #[test]
    fn non_neg_tracks_runtime_flag_and_compiletime_value() {
        let mut s = Source::RunTime(RunTimeSource::dummy());
        assert!(!s.is_non_neg());
        s.set_non_neg();
        assert!(s.is_non_neg());

        let neg = Source::CompileTime(CompileTimeSource::new(Known::integer(-1)));
        assert!(!neg.is_non_neg());
        let pos = Source::CompileTime(CompileTimeSource::new(Known::integer(1)));
        assert!(pos.is_non_neg());
    }

    #[test]
    fn clear_ref_is_a_noop_off_runtime() {
        let mut s = Source::CompileTime(CompileTimeSource::new(Known::integer(1)));
        s.clear_ref();
        assert!(!s.has_ref());
    }
}
