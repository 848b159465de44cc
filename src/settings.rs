//! Compiler tuning knobs (`SPEC_FULL.md` §2.3).
//!
//! Mirrors the shape of `cranelift_codegen::settings`: a `Builder` collects
//! overrides, `Builder::finish` produces an immutable, `Arc`-shared
//! `Settings` that every `CompilerState` spawned from one `Compiler` reads
//! from. There is no per-setting dynamic lookup table here (the original's
//! settings are a handful of fixed constants, not an open-ended DSL-defined
//! set), so `Builder` is a plain struct-update builder rather than a string
//! keyed one.

use std::fmt;

/// Immutable, shared compiler configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Number of distinct observed values a promotion stub's local cache
    /// holds before recompiling once with the `megamorphic` flag and
    /// freezing further specialization at that site (`spec.md` §3, §8).
    pub megamorphic_max: usize,

    /// Minimum remaining capacity, in bytes, a code buffer must retain
    /// before an emission is allowed to proceed without triggering
    /// `emergency_enlarge` (`spec.md` §4.11, §8).
    pub buffer_margin_bytes: usize,

    /// Size, in bytes, of a freshly reserved executable slab
    /// (`spec.md` §4.11, "target ~1 MiB per slab").
    pub slab_size_bytes: usize,

    /// Bytecode distance after which a merge point is forced even absent a
    /// confluence, so long linear regions still get one (`spec.md` §4.8,
    /// §8 "Exactly MAX_UNINTERRUPTED_RANGE bytecodes...").
    pub max_uninterrupted_range: u32,

    /// Cap on how far a later confluence point may absorb an earlier
    /// zero-weight one during merge-point placement (`spec.md` §4.8).
    pub confluence_total_delay: u32,

    /// Width, in locals, of each back-propagation sweep when computing
    /// live-variable masks for early deletion (`spec.md` §4.8).
    pub vars_per_pass: u32,

    /// Upper bound (exclusive) on a `RunTimeSource`'s `stack_offset`
    /// (`spec.md` §8 invariant 1).
    pub runtime_stack_max: u32,

    /// When set, a snapshot's compression pass skips compile-time
    /// sub-arrays entirely, relying on them being reloadable
    /// (`spec.md` §4.3, flag `COMPRESS_COMPILETIME_SUBITEMS`).
    pub compress_compiletime_subitems: bool,

    /// Ceiling that a chain of nested virtual-time values' weights must
    /// stay under (`spec.md` §3 `nested_weight`, matching
    /// `NESTED_WEIGHT_END` in the original).
    pub nested_weight_end: u8,

    /// Headroom, in evaluation-stack slots, a per-thread virtual-machine
    /// back-end keeps free before growing its stack (`spec.md` §5
    /// "`stack_size_margin` margin").
    pub stack_size_margin: u32,

    /// Growth granularity, in evaluation-stack slots, applied each time a
    /// per-thread evaluation stack needs to grow (`spec.md` §5
    /// "`extra_stack_size` growth granularity").
    pub extra_stack_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            megamorphic_max: 5,
            buffer_margin_bytes: 1024,
            slab_size_bytes: 1 << 20,
            max_uninterrupted_range: 200,
            confluence_total_delay: 16,
            vars_per_pass: 32,
            runtime_stack_max: 1 << 26,
            compress_compiletime_subitems: true,
            nested_weight_end: 15,
            stack_size_margin: 16,
            extra_stack_size: 256,
        }
    }
}

impl Settings {
    /// Start building a non-default configuration.
    pub fn builder() -> Builder {
        Builder {
            settings: Settings::default(),
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "megamorphic_max           = {}", self.megamorphic_max)?;
        writeln!(f, "buffer_margin_bytes       = {}", self.buffer_margin_bytes)?;
        writeln!(f, "slab_size_bytes           = {}", self.slab_size_bytes)?;
        writeln!(
            f,
            "max_uninterrupted_range   = {}",
            self.max_uninterrupted_range
        )?;
        writeln!(
            f,
            "confluence_total_delay    = {}",
            self.confluence_total_delay
        )?;
        writeln!(f, "vars_per_pass             = {}", self.vars_per_pass)?;
        writeln!(f, "runtime_stack_max         = {}", self.runtime_stack_max)?;
        writeln!(
            f,
            "compress_compiletime_subitems = {}",
            self.compress_compiletime_subitems
        )?;
        writeln!(f, "nested_weight_end         = {}", self.nested_weight_end)?;
        writeln!(f, "stack_size_margin         = {}", self.stack_size_margin)?;
        writeln!(f, "extra_stack_size          = {}", self.extra_stack_size)
    }
}

/// Builder for `Settings`, following the same struct-update pattern as
/// `cranelift_codegen::settings::Builder`.
#[derive(Clone, Debug, Default)]
pub struct Builder {
    settings: Settings,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.settings.$name = value;
            self
        }
    };
}

impl Builder {
    setter!(megamorphic_max, usize);
    setter!(buffer_margin_bytes, usize);
    setter!(slab_size_bytes, usize);
    setter!(max_uninterrupted_range, u32);
    setter!(confluence_total_delay, u32);
    setter!(vars_per_pass, u32);
    setter!(runtime_stack_max, u32);
    setter!(compress_compiletime_subitems, bool);
    setter!(nested_weight_end, u8);
    setter!(stack_size_margin, u32);
    setter!(extra_stack_size, u32);

    pub fn finish(self) -> Settings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let s = Settings::default();
        assert_eq!(s.megamorphic_max, 5);
        assert_eq!(s.buffer_margin_bytes, 1024);
        assert_eq!(s.slab_size_bytes, 1 << 20);
    }

    #[test]
    fn builder_overrides_single_field() {
        let s = Settings::builder().megamorphic_max(3).finish();
        assert_eq!(s.megamorphic_max, 3);
        assert_eq!(s.buffer_margin_bytes, Settings::default().buffer_margin_bytes);
    }
}
