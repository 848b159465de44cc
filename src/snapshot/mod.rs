//! Frozen compiler state at a merge point (`spec.md` §4.3).
//!
//! A `Snapshot` is the compressed form of whatever live vinfos a merge
//! point or promotion stub needs to remember; `crate::compat` compares a
//! live state against one to decide reuse, and `crate::unify` fixes up
//! live state to match one before jumping into its code.

mod codec;

pub use codec::SpecRegistry;

use crate::entities::{CodeBufferRef, VinfoRef};
use crate::settings::Settings;
use crate::vinfo::VinfoGraph;

/// A compressed snapshot of one or more vinfo roots, plus the bookkeeping
/// needed to unify a live state against it and jump into its code.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Snapshot {
    bytes: Vec<u8>,
    root_count: usize,
    /// Native stack depth this snapshot's state was recorded at
    /// (`crate::unify` step 1 grows the live stack to match).
    pub stack_depth: u32,
    /// Entry point to jump to once the live state has been unified with
    /// this snapshot, if the snapshot has compiled code yet (a freshly
    /// frozen promotion target does not, until its stub first fires).
    pub entry_point: Option<CodeBufferRef>,
}

impl Snapshot {
    /// An empty snapshot with no roots, no code yet. Used as a
    /// placeholder before a promotion stub's state has actually been
    /// frozen and as a test fixture.
    pub fn empty() -> Self {
        Snapshot {
            bytes: Vec::new(),
            root_count: 0,
            stack_depth: 0,
            entry_point: None,
        }
    }

    /// Compress every node reachable from `roots` into a new snapshot
    /// (`spec.md` §4.3 "Each snapshot stores the vinfo graph as a
    /// prefix-packed byte stream").
    pub fn compress(
        graph: &VinfoGraph,
        roots: &[VinfoRef],
        stack_depth: u32,
        settings: &Settings,
    ) -> Self {
        Snapshot {
            bytes: codec::encode(graph, roots, settings),
            root_count: roots.len(),
            stack_depth,
            entry_point: None,
        }
    }

    /// Reconstruct this snapshot's roots into fresh nodes of `graph`.
    ///
    /// Per the round-trip law in `spec.md` §8, `unfreeze(compress(state))`
    /// must be graph-isomorphic to `state`; compile-time sub-arrays
    /// dropped under `compress_compiletime_subitems` come back with no
    /// children, matching the "content is reloadable" contract (callers
    /// that need those children reload them from elsewhere, e.g. a type's
    /// static layout).
    pub fn unfreeze(&self, graph: &mut VinfoGraph, registry: &dyn SpecRegistry) -> Vec<VinfoRef> {
        codec::decode(&self.bytes, graph, registry, self.root_count)
    }

    pub fn root_count(&self) -> usize {
        self.root_count
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VirtualSpec;
    use std::sync::Arc;

    struct NoSpecs;
    impl SpecRegistry for NoSpecs {
        fn lookup(&self, _name: &str) -> Option<Arc<dyn VirtualSpec>> {
            None
        }
    }

    #[test]
    fn empty_snapshot_has_no_roots() {
        let s = Snapshot::empty();
        assert_eq!(s.root_count(), 0);
        assert!(s.is_empty());
    }

    #[test]
    fn compress_then_unfreeze_reproduces_a_known_integer() {
        let mut g = VinfoGraph::new();
        let v = g.new_known_integer(5);
        let settings = Settings::default();
        let snap = Snapshot::compress(&g, &[v], 16, &settings);
        assert_eq!(snap.stack_depth, 16);

        let mut g2 = VinfoGraph::new();
        let roots = snap.unfreeze(&mut g2, &NoSpecs);
        assert_eq!(roots.len(), 1);
    }
}
