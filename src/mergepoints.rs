//! Bytecode analysis: locating merge points and computing early-deletion
//! live-variable masks before compilation starts (`spec.md` §4.8).

use crate::bytecode::{Instruction, InstructionClass};
use crate::entities::{BytecodeOffset, LocalIndex, SnapshotRef};
use crate::settings::Settings;
use cranelift_entity::EntityRef;
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Trails the merge point array (`spec.md` §4.8 "A flag word trails
    /// the array").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u8 {
        const HAS_EXCEPT = 1 << 0;
        const HAS_FINALLY = 1 << 1;
        const INLINABLE = 1 << 2;
        const MODULE_ONLY = 1 << 3;
        const CONTROL_FLOW_ANALYZED = 1 << 4;
    }
}

impl Default for FunctionFlags {
    fn default() -> Self {
        FunctionFlags::empty()
    }
}

/// One candidate reuse point: a confluence of ≥2 incoming control-flow
/// paths, or a position forced by `MAX_UNINTERRUPTED_RANGE`.
#[derive(Debug, Clone)]
pub struct MergePoint {
    pub offset: BytecodeOffset,
    /// Locals proven dead by the time control reaches this point, fed to
    /// early deletion during dispatch.
    pub dead_locals: Vec<bool>,
    pub snapshots: Vec<SnapshotRef>,
}

impl MergePoint {
    pub fn is_dead(&self, local: LocalIndex) -> bool {
        self.dead_locals.get(local.index()).copied().unwrap_or(false)
    }
}

/// The sorted merge-point table for one function, looked up by binary
/// search (`spec.md` §4.8 "Lookup is by binary search").
#[derive(Debug, Default)]
pub struct MergePointTable {
    points: Vec<MergePoint>,
    pub flags: FunctionFlags,
}

impl MergePointTable {
    pub fn lookup(&self, offset: BytecodeOffset) -> Option<&MergePoint> {
        self.points
            .binary_search_by_key(&offset, |p| p.offset)
            .ok()
            .map(|i| &self.points[i])
    }

    pub fn lookup_mut(&mut self, offset: BytecodeOffset) -> Option<&mut MergePoint> {
        match self.points.binary_search_by_key(&offset, |p| p.offset) {
            Ok(i) => Some(&mut self.points[i]),
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MergePoint> {
        self.points.iter()
    }
}

/// Analyze `instrs` into a sorted merge-point table.
///
/// `local_count` bounds the live-variable masks; functions are expected
/// to have already been rejected (by the caller, via
/// `crate::error::UnsupportedReason`) if they contain unsupported
/// opcodes, generators, free/cell vars or `**kwargs` — this pass assumes
/// a function already cleared for analysis.
pub fn analyze<I: Instruction>(
    instrs: &[I],
    local_count: u32,
    settings: &Settings,
) -> MergePointTable {
    let offsets = confluence_offsets(instrs, settings);
    let dead = back_propagate_liveness(instrs, local_count, &offsets, settings);

    let points = offsets
        .into_iter()
        .map(|offset| MergePoint {
            dead_locals: dead.get(&offset).cloned().unwrap_or_default(),
            snapshots: Vec::new(),
            offset,
        })
        .collect();

    MergePointTable {
        points,
        flags: FunctionFlags::CONTROL_FLOW_ANALYZED,
    }
}

/// In-degree of every offset that has one, by scanning fallthrough and
/// jump/branch edges.
fn predecessor_counts<I: Instruction>(instrs: &[I]) -> BTreeMap<u32, u32> {
    let mut preds: BTreeMap<u32, u32> = BTreeMap::new();
    for (idx, instr) in instrs.iter().enumerate() {
        match instr.class() {
            InstructionClass::Jump => {
                for t in instr.targets() {
                    *preds.entry(t.0).or_insert(0) += 1;
                }
            }
            _ => {
                if let Some(next) = instrs.get(idx + 1) {
                    *preds.entry(next.offset().0).or_insert(0) += 1;
                }
                for t in instr.targets() {
                    *preds.entry(t.0).or_insert(0) += 1;
                }
            }
        }
    }
    preds
}

/// Confluence points plus range-forced points, absorbing zero-weight
/// confluences into the point immediately before them up to
/// `confluence_total_delay` (`spec.md` §4.8, second bullet).
fn confluence_offsets<I: Instruction>(instrs: &[I], settings: &Settings) -> Vec<BytecodeOffset> {
    let preds = predecessor_counts(instrs);
    let mut points = Vec::new();
    let mut last: Option<i64> = None;
    let mut absorbed_gap: u32 = 0;

    for instr in instrs {
        let off = instr.offset().0;
        let is_confluence = off == 0 || preds.get(&off).copied().unwrap_or(0) >= 2;
        let distance = last.map(|l| off as i64 - l);
        let forced_by_range = matches!(distance, Some(d) if d as u32 >= settings.max_uninterrupted_range);

        if !is_confluence && !forced_by_range {
            continue;
        }

        if is_confluence && distance == Some(0) && absorbed_gap < settings.confluence_total_delay {
            // Zero-weight confluence immediately after the last merge
            // point: absorb it rather than doubling up.
            absorbed_gap += 1;
            continue;
        }

        points.push(BytecodeOffset(off));
        last = Some(off as i64);
        absorbed_gap = 0;
    }
    points
}

/// Back-propagate liveness in `Settings::vars_per_pass`-wide sweeps,
/// recording which locals are dead at each candidate merge point.
///
/// Each sweep makes one backward scan over `instrs` covering one slice of
/// local indices, mirroring the original's fixed-width bitset passes
/// rather than allocating one unbounded bitset per local count.
fn back_propagate_liveness<I: Instruction>(
    instrs: &[I],
    local_count: u32,
    merge_offsets: &[BytecodeOffset],
    settings: &Settings,
) -> BTreeMap<BytecodeOffset, Vec<bool>> {
    let mut dead: BTreeMap<BytecodeOffset, Vec<bool>> = merge_offsets
        .iter()
        .map(|&o| (o, vec![false; local_count as usize]))
        .collect();

    let chunk = settings.vars_per_pass.max(1);
    let mut lo = 0u32;
    while lo < local_count {
        let hi = (lo + chunk).min(local_count);
        let width = (hi - lo) as usize;
        let mut live = vec![false; width];

        for instr in instrs.iter().rev() {
            if let Some(slots) = dead.get_mut(&instr.offset()) {
                for i in 0..width {
                    slots[(lo as usize) + i] = !live[i];
                }
            }
            if let Some(idx) = instr.reads_local() {
                let i = idx.index() as u32;
                if i >= lo && i < hi {
                    live[(i - lo) as usize] = true;
                }
            }
            if let Some(idx) = instr.writes_local() {
                let i = idx.index() as u32;
                if i >= lo && i < hi {
                    live[(i - lo) as usize] = false;
                }
            }
        }
        lo = hi;
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::LocalIndex;

    #[derive(Clone)]
    struct Instr {
        offset: u32,
        class: InstructionClass,
        targets: Vec<BytecodeOffset>,
        reads: Option<usize>,
        writes: Option<usize>,
    }

    impl Instruction for Instr {
        fn offset(&self) -> BytecodeOffset {
            BytecodeOffset(self.offset)
        }
        fn class(&self) -> InstructionClass {
            self.class
        }
        fn targets(&self) -> &[BytecodeOffset] {
            &self.targets
        }
        fn mnemonic(&self) -> &str {
            "test"
        }
        fn reads_local(&self) -> Option<LocalIndex> {
            self.reads.map(LocalIndex::new)
        }
        fn writes_local(&self) -> Option<LocalIndex> {
            self.writes.map(LocalIndex::new)
        }
    }

    fn light(offset: u32) -> Instr {
        Instr {
            offset,
            class: InstructionClass::Light,
            targets: vec![],
            reads: None,
            writes: None,
        }
    }

    #[test]
    fn entry_offset_is_always_a_merge_point() {
        let instrs = vec![light(0), light(1), light(2)];
        let settings = Settings::default();
        let table = analyze(&instrs, 0, &settings);
        assert!(table.lookup(BytecodeOffset(0)).is_some());
    }

    #[test]
    fn loop_back_edge_creates_a_confluence_merge_point() {
        let instrs = vec![
            light(0),
            Instr {
                offset: 1,
                class: InstructionClass::Jump,
                targets: vec![BytecodeOffset(0)],
                reads: None,
                writes: None,
            },
        ];
        let settings = Settings::default();
        let table = analyze(&instrs, 0, &settings);
        // offset 0 has two predecessors: function entry and the back-edge.
        assert!(table.lookup(BytecodeOffset(0)).is_some());
    }

    #[test]
    fn long_uninterrupted_run_forces_a_merge_point() {
        let settings = Settings::builder().max_uninterrupted_range(4).finish();
        let instrs: Vec<Instr> = (0..10).map(light).collect();
        let table = analyze(&instrs, 0, &settings);
        assert!(table.len() > 1, "a run of 10 bytecodes with range 4 must force extra merge points");
    }

    #[test]
    fn local_written_before_any_read_is_dead_at_entry() {
        let instrs = vec![
            light(0),
            Instr {
                offset: 1,
                class: InstructionClass::Light,
                targets: vec![],
                reads: None,
                writes: Some(0),
            },
        ];
        let settings = Settings::default();
        let table = analyze(&instrs, 1, &settings);
        let entry = table.lookup(BytecodeOffset(0)).unwrap();
        assert!(entry.is_dead(LocalIndex::new(0)));
    }
}
