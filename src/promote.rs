//! Promotion and un-promotion: turning a run-time value into a
//! compile-time one, and back (`spec.md` §4.6).
//!
//! Grounded on the original's promotion stub (`vcompiler.h`'s
//! `promotion_array_t` and the `psyco_protect_analyse`/`psyco_finish_promotion`
//! pair) and on the megamorphic-cache behavior spelled out in `spec.md`
//! §8's boundary behaviors and scenario 2.

use crate::entities::VinfoRef;
use crate::snapshot::Snapshot;
use crate::source::Known;
use log::{debug, trace};
use smallvec::SmallVec;

/// Which kind of compile-time value a promotion installs.
///
/// Mirrors `spec.md` §6's "Promotion flavors: `{ integer, host_object,
/// host_object_megamorphic }`"; `Integer`/`HostObject` are the two normal
/// flavors and the megamorphic variant of each is represented by
/// `PromotionStub::megamorphic` rather than a fourth enum case, since it's
/// a property of the *stub*, not of the observed value, and applies
/// uniformly once tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionFlavor {
    Integer,
    HostObject,
}

/// What a handler hands to `Compiler::promote` when it needs to
/// specialize on a value it doesn't statically know (`spec.md` §4.6,
/// first paragraph).
#[derive(Debug)]
pub struct PromotionRequest {
    /// The vinfo whose source will become `Fixed` once the stub fires.
    pub vinfo: VinfoRef,
    pub flavor: PromotionFlavor,
}

impl PromotionRequest {
    pub fn new(vinfo: VinfoRef, flavor: PromotionFlavor) -> Self {
        PromotionRequest { vinfo, flavor }
    }
}

/// One observed-value -> compiled-target entry in a promotion stub's
/// cache, most-recently-used first (`spec.md` §3 "Promotion stub").
#[derive(Debug, Clone)]
struct CacheEntry {
    observed: Known,
    target: crate::entities::CodeBufferRef,
}

/// The frozen state and growing specialization cache at one promotion
/// site.
///
/// `frozen_state` is a `Snapshot` of the compiler state at the moment
/// `promote` suspended emission (`spec.md` §4.6 "the current compiler
/// state is frozen"); replaying forward from it with the observed value
/// bound is how each cache entry gets compiled.
#[derive(Debug)]
pub struct PromotionStub {
    pub vinfo: VinfoRef,
    pub flavor: PromotionFlavor,
    pub frozen_state: Snapshot,
    cache: SmallVec<[CacheEntry; 4]>,
    megamorphic: bool,
    megamorphic_max: usize,
}

impl PromotionStub {
    pub fn new(
        vinfo: VinfoRef,
        flavor: PromotionFlavor,
        frozen_state: Snapshot,
        megamorphic_max: usize,
    ) -> Self {
        PromotionStub {
            vinfo,
            flavor,
            frozen_state,
            cache: SmallVec::new(),
            megamorphic: false,
            megamorphic_max,
        }
    }

    pub fn is_megamorphic(&self) -> bool {
        self.megamorphic
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Look up a previously observed value's compiled target
    /// (`spec.md` §4.6 step 1).
    pub fn lookup(&mut self, observed: &Known) -> Option<crate::entities::CodeBufferRef> {
        let pos = self
            .cache
            .iter()
            .position(|e| e.observed.value == observed.value && e.observed.is_host_object == observed.is_host_object)?;
        let entry = self.cache.remove(pos);
        let target = entry.target;
        self.cache.insert(0, entry);
        Some(target)
    }

    /// Record a newly compiled specialization for `observed`, possibly
    /// tripping megamorphic mode once the cache hits
    /// `megamorphic_max` entries (`spec.md` §4.6 step 3, §8 boundary
    /// behavior).
    ///
    /// Returns `true` exactly when this call is the one that trips
    /// megamorphic mode, so the caller knows to recompile once more with
    /// the `megamorphic` flag set and then stop specializing at this
    /// site for good.
    pub fn install(&mut self, observed: Known, target: crate::entities::CodeBufferRef) -> bool {
        debug_assert!(!self.megamorphic, "installing into an already-megamorphic stub");
        self.cache.insert(0, CacheEntry { observed, target });
        trace!(
            "promotion stub for {} cached value, {} entries",
            self.vinfo,
            self.cache.len()
        );
        if self.cache.len() >= self.megamorphic_max {
            self.megamorphic = true;
            debug!(
                "promotion stub for {} reached megamorphic_max={}; disabling further specialization",
                self.vinfo, self.megamorphic_max
            );
            true
        } else {
            false
        }
    }
}
