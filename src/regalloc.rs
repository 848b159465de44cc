//! Register and condition-code allocation: a small circular policy
//! (`spec.md` §4.10).

use crate::entities::{RegId, VinfoRef};
use crate::error::CompileError;
use log::trace;

/// Emits the code a register/CC allocation decision requires. As with
/// `crate::vinfo::RefcountSink`, the allocator decides *what* needs to
/// happen; an `Isa` (see `crate::isa`) decides how to encode it.
pub trait RegSink {
    /// Spill `reg`'s current occupant to a fresh stack slot, returning
    /// the offset it now lives at.
    fn spill(&mut self, reg: RegId, occupant: VinfoRef) -> Result<crate::entities::StackOffset, CompileError>;
    /// Materialize whatever currently lives in the condition-code flags
    /// into `into`, before the next flag-clobbering instruction.
    fn materialize_cc(&mut self, into: RegId) -> Result<(), CompileError>;
}

/// A machine's available registers, in allocation-rotation order
/// (callee-saved first, per `spec.md` §4.10 "favors callee-saved
/// registers first"), plus which of them are byte-addressable.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    pub rotation: Vec<RegId>,
    pub byte_addressable: Vec<RegId>,
}

/// The circular register allocator for one compiler state.
#[derive(Debug)]
pub struct RegisterAllocator {
    file: RegisterFile,
    /// Current occupant of each register in `file.rotation`, by position.
    occupants: Vec<Option<VinfoRef>>,
    /// Index into `file.rotation` the cursor currently sits at.
    cursor: usize,
    /// Registers temporarily excluded from the next allocation window
    /// (`spec.md` §4.10 "delay(reg)").
    delayed: Vec<bool>,
    /// The vinfo currently represented by the condition-code flags, if
    /// any (`spec.md` §4.10 "need_cc").
    cc_holder: Option<VinfoRef>,
    cc_positive: Option<VinfoRef>,
    cc_negative: Option<VinfoRef>,
}

impl RegisterAllocator {
    pub fn new(file: RegisterFile) -> Self {
        let n = file.rotation.len();
        RegisterAllocator {
            file,
            occupants: vec![None; n],
            cursor: 0,
            delayed: vec![false; n],
            cc_holder: None,
            cc_positive: None,
            cc_negative: None,
        }
    }

    fn position(&self, reg: RegId) -> usize {
        self.file
            .rotation
            .iter()
            .position(|&r| r == reg)
            .expect("reg not part of this allocator's register file")
    }

    pub fn occupant(&self, reg: RegId) -> Option<VinfoRef> {
        self.occupants[self.position(reg)]
    }

    /// Ensure `reg` is free, spilling its current occupant if any
    /// (`spec.md` §4.10 "need_reg(reg)").
    pub fn need_reg(&mut self, reg: RegId, sink: &mut dyn RegSink) -> Result<(), CompileError> {
        let pos = self.position(reg);
        if let Some(occupant) = self.occupants[pos].take() {
            trace!("need_reg({reg}): spilling {occupant}");
            sink.spill(reg, occupant)?;
        }
        Ok(())
    }

    /// Advance the cursor until a free, non-delayed register is found,
    /// spilling if the whole rotation is occupied
    /// (`spec.md` §4.10 "need_free_reg()").
    pub fn need_free_reg(&mut self, sink: &mut dyn RegSink) -> Result<RegId, CompileError> {
        let n = self.occupants.len();
        for step in 0..n {
            let pos = (self.cursor + step) % n;
            if self.delayed[pos] {
                continue;
            }
            if self.occupants[pos].is_none() {
                self.cursor = (pos + 1) % n;
                return Ok(self.file.rotation[pos]);
            }
        }
        // Nothing free: spill whatever the cursor currently points at.
        let pos = self.cursor % n;
        let reg = self.file.rotation[pos];
        if let Some(occupant) = self.occupants[pos].take() {
            sink.spill(reg, occupant)?;
        }
        self.cursor = (pos + 1) % n;
        Ok(reg)
    }

    pub fn assign(&mut self, reg: RegId, occupant: VinfoRef) {
        let pos = self.position(reg);
        self.occupants[pos] = Some(occupant);
    }

    /// Exclude `reg` from the next allocation window
    /// (`spec.md` §4.10 "delay(reg)").
    pub fn delay(&mut self, reg: RegId) {
        let pos = self.position(reg);
        self.delayed[pos] = true;
    }

    /// Clear every register's delay flag, starting a fresh window.
    pub fn clear_delays(&mut self) {
        self.delayed.iter_mut().for_each(|d| *d = false);
    }

    /// Pick a free register restricted to the byte-addressable subset
    /// (`spec.md` §4.10 "reserve_byte_reg()").
    pub fn reserve_byte_reg(&mut self, sink: &mut dyn RegSink) -> Result<RegId, CompileError> {
        for &reg in &self.file.byte_addressable.clone() {
            let pos = self.position(reg);
            if self.occupants[pos].is_none() && !self.delayed[pos] {
                return Ok(reg);
            }
        }
        let reg = self.file.byte_addressable[0];
        self.need_reg(reg, sink)?;
        Ok(reg)
    }

    /// If a vinfo currently lives only in the flags, materialize it into
    /// a register before the next flag-clobbering emission
    /// (`spec.md` §4.10 "need_cc()").
    pub fn need_cc(&mut self, sink: &mut dyn RegSink) -> Result<(), CompileError> {
        if let Some(_holder) = self.cc_holder.take() {
            let reg = self.need_free_reg(sink)?;
            sink.materialize_cc(reg)?;
        }
        Ok(())
    }

    /// Record that `holder`'s value now lives in the condition-code
    /// flags, with `positive`/`negative` the vinfos representing the
    /// flags-true and flags-false outcomes (`spec.md` §4.10
    /// "force_cc(cc)").
    pub fn force_cc(&mut self, holder: VinfoRef, positive: Option<VinfoRef>, negative: Option<VinfoRef>) {
        self.cc_holder = Some(holder);
        self.cc_positive = positive;
        self.cc_negative = negative;
    }

    pub fn cc_slots(&self) -> (Option<VinfoRef>, Option<VinfoRef>) {
        (self.cc_positive, self.cc_negative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        spills: Vec<RegId>,
    }
    impl RegSink for RecordingSink {
        fn spill(&mut self, reg: RegId, _occupant: VinfoRef) -> Result<crate::entities::StackOffset, CompileError> {
            self.spills.push(reg);
            Ok(0)
        }
        fn materialize_cc(&mut self, _into: RegId) -> Result<(), CompileError> {
            Ok(())
        }
    }

    fn file(n: u16) -> RegisterFile {
        let regs: Vec<RegId> = (0..n).map(RegId).collect();
        RegisterFile {
            rotation: regs.clone(),
            byte_addressable: regs,
        }
    }

    #[test]
    fn need_free_reg_advances_cursor_round_robin() {
        let mut alloc = RegisterAllocator::new(file(3));
        let mut sink = RecordingSink { spills: Vec::new() };
        let a = alloc.need_free_reg(&mut sink).unwrap();
        let b = alloc.need_free_reg(&mut sink).unwrap();
        assert_ne!(a, b);
        assert!(sink.spills.is_empty());
    }

    #[test]
    fn fully_occupied_file_spills_to_make_room() {
        let mut alloc = RegisterAllocator::new(file(2));
        let mut sink = RecordingSink { spills: Vec::new() };
        let mut graph = crate::vinfo::VinfoGraph::new();
        let v0 = graph.new_dummy();
        let v1 = graph.new_dummy();
        let r0 = alloc.need_free_reg(&mut sink).unwrap();
        alloc.assign(r0, v0);
        let r1 = alloc.need_free_reg(&mut sink).unwrap();
        alloc.assign(r1, v1);
        let _r2 = alloc.need_free_reg(&mut sink).unwrap();
        assert_eq!(sink.spills.len(), 1, "third allocation must spill an occupant");
    }

    #[test]
    fn delayed_register_is_skipped_until_cleared() {
        let mut alloc = RegisterAllocator::new(file(2));
        let mut sink = RecordingSink { spills: Vec::new() };
        alloc.delay(RegId(0));
        let r = alloc.need_free_reg(&mut sink).unwrap();
        assert_eq!(r, RegId(1));
    }
}
