//! Unification: fixing up live state to match a snapshot, then jumping
//! into its code; and un-promotion, the partial-match fallback
//! (`spec.md` §4.5).

use crate::compat::Match;
use crate::entities::{CodeBufferRef, RegId, StackOffset, VinfoRef};
use crate::error::CompileError;
use crate::snapshot::{Snapshot, SpecRegistry};
use crate::source::{Known, Source};
use crate::vinfo::VinfoGraph;
use log::trace;

/// Where a run-time value can live, for the purposes of the move/exchange
/// pass in step 5 of `spec.md` §4.5.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Stack(StackOffset),
    Register(RegId),
}

/// Emits the fix-up and jump instructions `unify` decides are needed.
/// Kept as a trait for the same reason `crate::vinfo::RefcountSink` is:
/// this module reasons about *what* fixup is needed, not about ISA
/// encoding or code-buffer placement.
pub trait UnifySink {
    fn grow_stack(&mut self, to_depth: u32) -> Result<(), CompileError>;
    fn move_value(&mut self, from: Location, to: Location) -> Result<(), CompileError>;
    fn exchange(&mut self, a: Location, b: Location) -> Result<(), CompileError>;
    fn emit_incref(&mut self, at: Location) -> Result<(), CompileError>;
    fn emit_decref(&mut self, at: Location) -> Result<(), CompileError>;
    /// Load `value`'s bits directly into `to`, for un-promotion
    /// (`spec.md` §4.5, last paragraph).
    fn load_constant(&mut self, value: &Known, to: Location) -> Result<(), CompileError>;
    fn jump_to(&mut self, target: CodeBufferRef) -> Result<(), CompileError>;
}

/// Perform the six-step fixup (`spec.md` §4.5) transitioning `live_roots`
/// into the shape of `m`'s snapshot, then jump to its entry point.
///
/// Only called on exact matches (`m.diff.is_empty()`); partial matches go
/// through `unpromote_diff` first, which restarts the compatibility check
/// from the updated state rather than calling this directly.
#[allow(clippy::too_many_arguments)]
pub fn unify(
    graph: &mut VinfoGraph,
    live_roots: &[VinfoRef],
    m: &Match,
    snapshot: &Snapshot,
    registry: &dyn SpecRegistry,
    live_depth: u32,
    sink: &mut dyn UnifySink,
) -> Result<(), CompileError> {
    debug_assert!(m.is_exact(), "unify called on a partial match; un-promote first");

    // Step 1: grow the native stack to the snapshot's depth.
    let snapshot_depth = snapshot.stack_depth;
    if snapshot_depth > live_depth {
        trace!("unify: growing stack from {live_depth} to {snapshot_depth}");
        sink.grow_stack(snapshot_depth)?;
    }

    // Steps 2-5: move/exchange runtime values into the snapshot's
    // recorded locations and balance refcounts against it. The snapshot
    // is unfrozen into a scratch graph purely to read back where each
    // root is expected to live; nothing in it is emitted.
    let mut snap_graph = VinfoGraph::new();
    let snap_roots = snapshot.unfreeze(&mut snap_graph, registry);
    reconcile_roots(graph, live_roots, &snap_graph, &snap_roots, sink)?;

    // Step 6: jump to the snapshot's code.
    if let Some(target) = snapshot.entry_point {
        sink.jump_to(target)?;
    }
    Ok(())
}

/// One root's live and target locations, for the move/exchange pass.
struct RootFixup {
    root: VinfoRef,
    live_loc: Option<Location>,
    snap_loc: Option<Location>,
    live_has_ref: bool,
    snap_has_ref: bool,
}

fn location_of(rt: &crate::source::RunTimeSource) -> Option<Location> {
    match rt.register {
        Some(reg) => Some(Location::Register(reg)),
        None => rt.stack_offset.map(Location::Stack),
    }
}

/// Steps 2-5 of `spec.md` §4.5, across every root at once.
///
/// Exact matches already guarantee each live root and its corresponding
/// snapshot root agree on `Source` variant (`crate::compat::compare_node`);
/// only `RunTime` roots carry a location to reconcile. A full
/// allocator-aware implementation resolves arbitrary move-graph cycles by
/// routing through scratch slots, which is `crate::regalloc`'s job; here
/// we detect and break the common two-root swap directly via `exchange`
/// and otherwise move roots independently.
fn reconcile_roots(
    graph: &mut VinfoGraph,
    live_roots: &[VinfoRef],
    snap_graph: &VinfoGraph,
    snap_roots: &[VinfoRef],
    sink: &mut dyn UnifySink,
) -> Result<(), CompileError> {
    let mut fixups = Vec::with_capacity(live_roots.len());
    for (&live, &snap) in live_roots.iter().zip(snap_roots.iter()) {
        let (Source::RunTime(live_rt), Source::RunTime(snap_rt)) =
            (graph.get(live).source.clone(), snap_graph.get(snap).source.clone())
        else {
            continue;
        };
        fixups.push(RootFixup {
            root: live,
            live_loc: location_of(&live_rt),
            snap_loc: location_of(&snap_rt),
            live_has_ref: live_rt.has_ref,
            snap_has_ref: snap_rt.has_ref,
        });
    }

    let mut moved = vec![false; fixups.len()];
    for i in 0..fixups.len() {
        if moved[i] {
            continue;
        }
        let (Some(live_i), Some(snap_i)) = (fixups[i].live_loc, fixups[i].snap_loc) else {
            continue;
        };
        if live_i == snap_i {
            continue;
        }
        if let Some(j) = fixups.iter().enumerate().position(|(j, f)| {
            j != i && !moved[j] && f.live_loc == Some(snap_i) && f.snap_loc == Some(live_i)
        }) {
            trace!("unify: exchanging {} and {}", fixups[i].root, fixups[j].root);
            sink.exchange(live_i, snap_i)?;
            moved[i] = true;
            moved[j] = true;
        } else {
            trace!("unify: moving {} from {live_i:?} to {snap_i:?}", fixups[i].root);
            sink.move_value(live_i, snap_i)?;
            moved[i] = true;
        }
    }

    for fixup in &fixups {
        if fixup.snap_has_ref && !fixup.live_has_ref {
            if let Some(loc) = fixup.snap_loc.or(fixup.live_loc) {
                trace!("unify: increffing {} at {loc:?} to match the snapshot", fixup.root);
                sink.emit_incref(loc)?;
            }
        } else if fixup.live_has_ref && !fixup.snap_has_ref {
            if let Some(loc) = fixup.snap_loc.or(fixup.live_loc) {
                trace!("unify: decreffing {} at {loc:?}, unrepresented in the snapshot", fixup.root);
                sink.emit_decref(loc)?;
            }
        }
    }

    Ok(())
}

/// Turn every vinfo listed in a partial match's `diff` back into a
/// run-time value (`spec.md` §4.5 "un-promotes each compile-time vinfo
/// listed in the diff"). The caller is expected to re-run
/// `crate::compat::compatible` against the resulting state afterward.
pub fn unpromote_diff(
    graph: &mut VinfoGraph,
    diff: &[VinfoRef],
    sink: &mut dyn UnifySink,
    mut alloc_slot: impl FnMut() -> Location,
) -> Result<(), CompileError> {
    for &v in diff {
        unpromote_one(graph, v, sink, &mut alloc_slot)?;
    }
    Ok(())
}

fn unpromote_one(
    graph: &mut VinfoGraph,
    v: VinfoRef,
    sink: &mut dyn UnifySink,
    alloc_slot: &mut impl FnMut() -> Location,
) -> Result<(), CompileError> {
    let known = match &graph.get(v).source {
        Source::CompileTime(ct) => *ct.known,
        _ => {
            debug_assert!(false, "unpromote_one called on a non-compile-time vinfo");
            return Ok(());
        }
    };
    let slot = alloc_slot();
    sink.load_constant(&known, slot)?;
    let rt = match slot {
        Location::Register(reg) => crate::source::RunTimeSource::in_register(reg, false, known.value >= 0),
        Location::Stack(off) => crate::source::RunTimeSource::on_stack(off, false, known.value >= 0),
    };
    graph.get_mut(v).source = Source::RunTime(rt);
    trace!("unify: un-promoted {v} back to run-time at {slot:?}");
    Ok(())
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Location::Stack(off) => write!(f, "stack+{off}"),
            Location::Register(r) => write!(f, "{r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::SnapshotRef;
    use crate::settings::Settings;
    use crate::source::RunTimeSource;
    use cranelift_entity::EntityRef;

    struct NoSpecs;
    impl SpecRegistry for NoSpecs {
        fn lookup(&self, _name: &str) -> Option<std::sync::Arc<dyn crate::source::VirtualSpec>> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        loaded: Vec<(Known, Location)>,
        moves: Vec<(Location, Location)>,
        exchanges: Vec<(Location, Location)>,
        increfs: Vec<Location>,
        decrefs: Vec<Location>,
        jumped: Option<CodeBufferRef>,
        grown_to: Option<u32>,
    }

    impl UnifySink for RecordingSink {
        fn grow_stack(&mut self, to_depth: u32) -> Result<(), CompileError> {
            self.grown_to = Some(to_depth);
            Ok(())
        }
        fn move_value(&mut self, from: Location, to: Location) -> Result<(), CompileError> {
            self.moves.push((from, to));
            Ok(())
        }
        fn exchange(&mut self, a: Location, b: Location) -> Result<(), CompileError> {
            self.exchanges.push((a, b));
            Ok(())
        }
        fn emit_incref(&mut self, at: Location) -> Result<(), CompileError> {
            self.increfs.push(at);
            Ok(())
        }
        fn emit_decref(&mut self, at: Location) -> Result<(), CompileError> {
            self.decrefs.push(at);
            Ok(())
        }
        fn load_constant(&mut self, value: &Known, to: Location) -> Result<(), CompileError> {
            self.loaded.push((*value, to));
            Ok(())
        }
        fn jump_to(&mut self, target: CodeBufferRef) -> Result<(), CompileError> {
            self.jumped = Some(target);
            Ok(())
        }
    }

    #[test]
    fn unpromote_turns_compiletime_vinfo_into_runtime() {
        let mut g = VinfoGraph::new();
        let v = g.new_known_integer(42);
        let mut sink = RecordingSink::default();
        let mut next_reg = 0u16;
        unpromote_diff(&mut g, &[v], &mut sink, || {
            let r = Location::Register(RegId(next_reg));
            next_reg += 1;
            r
        })
        .unwrap();

        assert_eq!(sink.loaded.len(), 1);
        assert!(g.get(v).source.is_runtime());
    }

    #[test]
    fn exact_match_unify_jumps_to_entry() {
        let settings = Settings::default();
        let mut g = VinfoGraph::new();
        let v = g.new_dummy();
        let snap_graph = VinfoGraph::new();
        let snapshot = Snapshot::compress(&snap_graph, &[], 0, &settings);
        let m = Match {
            entry: SnapshotRef::new(0),
            diff: Vec::new(),
        };
        let mut sink = RecordingSink::default();
        unify(&mut g, &[], &m, &snapshot, &NoSpecs, 0, &mut sink).unwrap();
        assert!(sink.jumped.is_none(), "a snapshot with no entry point yet must not emit a jump");
    }

    #[test]
    fn unify_moves_a_root_into_the_snapshots_register() {
        let settings = Settings::default();

        let mut g = VinfoGraph::new();
        let v = g.new_vinfo(Source::RunTime(RunTimeSource::on_stack(0, false, false)));

        let mut snap_source = VinfoGraph::new();
        snap_source.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(2), false, false)));
        let snapshot = Snapshot::compress(&snap_source, &[VinfoRef::new(0)], 0, &settings);

        let m = Match {
            entry: SnapshotRef::new(0),
            diff: Vec::new(),
        };
        let mut sink = RecordingSink::default();
        unify(&mut g, &[v], &m, &snapshot, &NoSpecs, 0, &mut sink).unwrap();

        assert_eq!(sink.moves, vec![(Location::Stack(0), Location::Register(RegId(2)))]);
        assert!(sink.exchanges.is_empty());
    }

    #[test]
    fn unify_increfs_a_root_the_snapshot_expects_to_be_held() {
        let settings = Settings::default();

        let mut g = VinfoGraph::new();
        let v = g.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(0), false, false)));

        let mut snap_source = VinfoGraph::new();
        snap_source.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(0), true, false)));
        let snapshot = Snapshot::compress(&snap_source, &[VinfoRef::new(0)], 0, &settings);

        let m = Match {
            entry: SnapshotRef::new(0),
            diff: Vec::new(),
        };
        let mut sink = RecordingSink::default();
        unify(&mut g, &[v], &m, &snapshot, &NoSpecs, 0, &mut sink).unwrap();

        assert_eq!(sink.increfs, vec![Location::Register(RegId(0))]);
        assert!(sink.decrefs.is_empty());
        assert!(sink.moves.is_empty(), "same location on both sides needs no move");
    }

    #[test]
    fn unify_decrefs_a_root_unrepresented_in_the_snapshot() {
        let settings = Settings::default();

        let mut g = VinfoGraph::new();
        let v = g.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(1), true, false)));

        let mut snap_source = VinfoGraph::new();
        snap_source.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(1), false, false)));
        let snapshot = Snapshot::compress(&snap_source, &[VinfoRef::new(0)], 0, &settings);

        let m = Match {
            entry: SnapshotRef::new(0),
            diff: Vec::new(),
        };
        let mut sink = RecordingSink::default();
        unify(&mut g, &[v], &m, &snapshot, &NoSpecs, 0, &mut sink).unwrap();

        assert_eq!(sink.decrefs, vec![Location::Register(RegId(1))]);
        assert!(sink.increfs.is_empty());
    }

    #[test]
    fn unify_exchanges_two_roots_that_swap_registers() {
        let settings = Settings::default();

        let mut g = VinfoGraph::new();
        let a = g.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(0), false, false)));
        let b = g.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(1), false, false)));

        let mut snap_source = VinfoGraph::new();
        snap_source.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(1), false, false)));
        snap_source.new_vinfo(Source::RunTime(RunTimeSource::in_register(RegId(0), false, false)));
        let snapshot = Snapshot::compress(&snap_source, &[VinfoRef::new(0), VinfoRef::new(1)], 0, &settings);

        let m = Match {
            entry: SnapshotRef::new(0),
            diff: Vec::new(),
        };
        let mut sink = RecordingSink::default();
        unify(&mut g, &[a, b], &m, &snapshot, &NoSpecs, 0, &mut sink).unwrap();

        assert_eq!(sink.exchanges, vec![(Location::Register(RegId(0)), Location::Register(RegId(1)))]);
        assert!(sink.moves.is_empty());
    }
}
