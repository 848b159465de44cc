//! A minimal AArch64 backend, covering the same `NativeOp` surface as
//! `crate::isa::x86_64` so the core never needs to know which
//! architecture it's targeting. Enabled by the `aarch64` feature
//! (`spec.md` §1 Non-goals: "Instruction selection of non-integer
//! numerics" is out of scope for every backend, integer-only here too).

use super::{Isa, NativeOp};
use crate::entities::RegId;
use crate::regalloc::RegisterFile;

/// `x19`-`x28` are callee-saved in the AArch64 procedure call standard;
/// `x0`-`x15` are caller-saved (argument/scratch) registers. Callee-saved
/// first, same rationale as `crate::isa::x86_64::CALLEE_SAVED`.
pub struct AArch64;

const CALLEE_SAVED: [u16; 5] = [19, 20, 21, 22, 23];
const CALLER_SAVED: [u16; 6] = [0, 1, 2, 3, 4, 5];

impl Isa for AArch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn register_file(&self) -> RegisterFile {
        let mut rotation: Vec<RegId> = CALLEE_SAVED.iter().map(|&n| RegId(n)).collect();
        rotation.extend(CALLER_SAVED.iter().map(|&n| RegId(n)));
        RegisterFile {
            byte_addressable: rotation.clone(),
            rotation,
        }
    }

    fn encode(&self, op: &NativeOp) -> Vec<u8> {
        match op {
            NativeOp::LoadImmediate { dst, value } => movz_movk_sequence(*dst, *value),
            NativeOp::Move { dst, src } => {
                // `mov dst, src` is `orr dst, xzr, src` on AArch64.
                vec![0xaa, 0x00, (src.0 as u8) << 5 | 0x03, 0xe0 | (reg5(*dst))]
            }
            NativeOp::Spill { src, to } => str_imm(*src, *to),
            NativeOp::Reload { dst, from } => ldr_imm(*dst, *from),
            NativeOp::AddImmediate { dst, value } => {
                let mut bytes = vec![0x91, 0x00];
                bytes.extend_from_slice(&(*value as u16).to_le_bytes());
                bytes.push(reg5(*dst));
                bytes
            }
            NativeOp::Add { dst, src } => vec![0x8b, reg5(*src), 0x00, reg5(*dst)],
            NativeOp::CompareImmediate { reg, value } => {
                let mut bytes = vec![0xf1, 0x00];
                bytes.extend_from_slice(&(*value as u16).to_le_bytes());
                bytes.push(reg5(*reg));
                bytes
            }
            NativeOp::JumpIfNotEqual { target } => {
                let mut bytes = vec![0x54];
                bytes.extend_from_slice(&(*target as i32).to_le_bytes());
                bytes.push(0x01); // `b.ne` condition code
                bytes
            }
            NativeOp::Jump { target } => {
                let mut bytes = vec![0x14];
                bytes.extend_from_slice(&(*target as i32).to_le_bytes());
                bytes
            }
            NativeOp::JumpToBuffer { .. } => vec![0x14, 0x00, 0x00, 0x00],
            NativeOp::Call { address } => {
                let mut bytes = vec![0x94];
                bytes.extend_from_slice(&(*address as i32).to_le_bytes());
                bytes
            }
            NativeOp::Return => vec![0xc0, 0x03, 0x5f, 0xd6],
        }
    }
}

fn reg5(reg: RegId) -> u8 {
    (reg.0 & 0x1f) as u8
}

/// `movz`/`movk` four-instruction sequence loading a full 64-bit
/// immediate, one 16-bit chunk per instruction, the way AArch64 always
/// must since there is no single-instruction 64-bit immediate load.
fn movz_movk_sequence(dst: RegId, value: i64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16);
    let bits = value as u64;
    for (shift, is_first) in [(0, true), (16, false), (32, false), (48, false)] {
        let chunk = ((bits >> shift) & 0xffff) as u16;
        bytes.push(if is_first { 0xd2 } else { 0xf2 });
        bytes.extend_from_slice(&chunk.to_le_bytes());
        bytes.push(reg5(dst));
    }
    bytes
}

fn str_imm(src: RegId, to: u32) -> Vec<u8> {
    let mut bytes = vec![0xf9, 0x00];
    bytes.extend_from_slice(&((to / 8) as u16).to_le_bytes());
    bytes.push(reg5(src));
    bytes
}

fn ldr_imm(dst: RegId, from: u32) -> Vec<u8> {
    let mut bytes = vec![0xf9, 0x40];
    bytes.extend_from_slice(&((from / 8) as u16).to_le_bytes());
    bytes.push(reg5(dst));
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_return_as_four_bytes() {
        let isa = AArch64;
        assert_eq!(isa.encode(&NativeOp::Return), vec![0xc0, 0x03, 0x5f, 0xd6]);
    }

    #[test]
    fn load_immediate_emits_one_instruction_per_16_bit_chunk() {
        let isa = AArch64;
        let bytes = isa.encode(&NativeOp::LoadImmediate { dst: RegId(0), value: 42 });
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn callee_saved_registers_come_first_in_the_rotation() {
        let isa = AArch64;
        let file = isa.register_file();
        assert_eq!(file.rotation[0], RegId(19));
    }
}
