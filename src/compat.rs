//! State compatibility: deciding whether a live vinfo graph matches a
//! merge point's snapshot, exactly or with un-promotion (`spec.md` §4.4).

use crate::entities::{SnapshotRef, VinfoRef};
use crate::snapshot::{Snapshot, SpecRegistry};
use crate::vinfo::VinfoGraph;
use rustc_hash::FxHashMap;

/// The result of a successful compatibility check.
///
/// `diff` lists live-side vinfos that must be un-promoted (turned back
/// into run-time values, see `crate::unify`) before the match becomes
/// exact; an empty `diff` is an exact match, ready for unification
/// directly.
#[derive(Debug, Clone)]
pub struct Match {
    pub entry: SnapshotRef,
    pub diff: Vec<VinfoRef>,
}

impl Match {
    pub fn is_exact(&self) -> bool {
        self.diff.is_empty()
    }
}

/// Compare `live_roots` (in `live_graph`) against every snapshot in
/// `candidates`, returning the best `Match`: an exact match wins over any
/// partial one, and among partial matches the smallest `diff` wins
/// (`spec.md` §4.4 "Return").
pub fn compatible(
    live_graph: &VinfoGraph,
    live_roots: &[VinfoRef],
    candidates: &[(SnapshotRef, &Snapshot)],
    registry: &dyn SpecRegistry,
) -> Option<Match> {
    let mut best: Option<Match> = None;
    for &(entry, snapshot) in candidates {
        let Some(m) = compatible_one(live_graph, live_roots, entry, snapshot, registry) else {
            continue;
        };
        if m.is_exact() {
            return Some(m);
        }
        match &best {
            Some(b) if b.diff.len() <= m.diff.len() => {}
            _ => best = Some(m),
        }
    }
    best
}

fn compatible_one(
    live_graph: &VinfoGraph,
    live_roots: &[VinfoRef],
    entry: SnapshotRef,
    snapshot: &Snapshot,
    registry: &dyn SpecRegistry,
) -> Option<Match> {
    let mut snap_graph = VinfoGraph::new();
    let snap_roots = snapshot.unfreeze(&mut snap_graph, registry);
    if snap_roots.len() != live_roots.len() {
        return None;
    }
    let mut sharing = FxHashMap::default();
    let mut diff = Vec::new();
    for (&live, &snap) in live_roots.iter().zip(snap_roots.iter()) {
        if !compare_slot(
            live_graph,
            &snap_graph,
            Some(live),
            Some(snap),
            &mut sharing,
            &mut diff,
        ) {
            return None;
        }
    }
    Some(Match { entry, diff })
}

fn compare_slot(
    live_graph: &VinfoGraph,
    snap_graph: &VinfoGraph,
    live: Option<VinfoRef>,
    snap: Option<VinfoRef>,
    sharing: &mut FxHashMap<VinfoRef, VinfoRef>,
    diff: &mut Vec<VinfoRef>,
) -> bool {
    match (live, snap) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(_), None) => false,
        (Some(live), Some(snap)) => compare_node(live_graph, snap_graph, live, snap, sharing, diff),
    }
}

fn compare_node(
    live_graph: &VinfoGraph,
    snap_graph: &VinfoGraph,
    live: VinfoRef,
    snap: VinfoRef,
    sharing: &mut FxHashMap<VinfoRef, VinfoRef>,
    diff: &mut Vec<VinfoRef>,
) -> bool {
    use crate::source::Source::*;

    if let Some(&expected_live) = sharing.get(&snap) {
        let live_node = live_graph.get(live).source.clone();
        let is_compiletime = matches!(live_node, CompileTime(_));
        // Shared compile-time values need not remain shared in the live graph.
        return is_compiletime || expected_live == live;
    }
    sharing.insert(snap, live);

    let snap_source = snap_graph.get(snap).source.clone();
    let live_source = live_graph.get(live).source.clone();

    let node_ok = match (&live_source, &snap_source) {
        (RunTime(lr), RunTime(sr)) => {
            lr.register == sr.register
                && lr.stack_offset.is_some() == sr.stack_offset.is_some()
                && lr.has_ref == sr.has_ref
                && (!sr.non_neg || lr.non_neg)
        }
        (CompileTime(lc), CompileTime(sc)) => {
            if lc.value_equals(sc) {
                true
            } else if !sc.known.fixed {
                diff.push(live);
                true
            } else {
                false
            }
        }
        (VirtualTime(lv), VirtualTime(sv)) => lv.spec.name() == sv.spec.name(),
        _ => false,
    };
    if !node_ok {
        return false;
    }

    let field_count = snap_graph.get(snap).field_count().max(live_graph.get(live).field_count());
    for i in 0..field_count {
        let l = live_graph.get(live).field(i);
        let s = snap_graph.get(snap).field(i);
        if !compare_slot(live_graph, snap_graph, l, s, sharing, diff) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::SnapshotRef;
    use crate::settings::Settings;
    use crate::snapshot::SpecRegistry;
    use crate::source::VirtualSpec;
    use std::sync::Arc;
    use cranelift_entity::EntityRef;

    struct NoSpecs;
    impl SpecRegistry for NoSpecs {
        fn lookup(&self, _name: &str) -> Option<Arc<dyn VirtualSpec>> {
            None
        }
    }

    #[test]
    fn identical_known_integers_match_exactly() {
        let mut live = VinfoGraph::new();
        let v = live.new_known_integer(10);
        let settings = Settings::default();

        let mut snap_source_graph = VinfoGraph::new();
        let sv = snap_source_graph.new_known_integer(10);
        let snapshot = Snapshot::compress(&snap_source_graph, &[sv], 0, &settings);

        let entry = SnapshotRef::new(0);
        let m = compatible(&live, &[v], &[(entry, &snapshot)], &NoSpecs).unwrap();
        assert!(m.is_exact());
    }

    #[test]
    fn unfixed_compiletime_snapshot_value_yields_diff() {
        let mut live = VinfoGraph::new();
        let v = live.new_known_integer(3);
        let settings = Settings::default();

        let mut snap_source_graph = VinfoGraph::new();
        let sv = snap_source_graph.new_vinfo(crate::source::Source::CompileTime(
            crate::source::CompileTimeSource::new(crate::source::Known::integer(9).not_fixed()),
        ));
        let snapshot = Snapshot::compress(&snap_source_graph, &[sv], 0, &settings);

        let entry = SnapshotRef::new(0);
        let m = compatible(&live, &[v], &[(entry, &snapshot)], &NoSpecs).unwrap();
        assert_eq!(m.diff, vec![v]);
    }

    #[test]
    fn mismatched_fixed_compiletime_values_are_incompatible() {
        let mut live = VinfoGraph::new();
        let v = live.new_known_integer(3);
        let settings = Settings::default();

        let mut snap_source_graph = VinfoGraph::new();
        let sv = snap_source_graph.new_known_integer(9);
        let snapshot = Snapshot::compress(&snap_source_graph, &[sv], 0, &settings);

        let entry = SnapshotRef::new(0);
        assert!(compatible(&live, &[v], &[(entry, &snapshot)], &NoSpecs).is_none());
    }
}
