//! A minimal x86-64 backend: enough encoding to make the integer-add
//! end-to-end scenario (`spec.md` §8, scenario 1) concrete. Not a general
//! x86-64 assembler; unhandled `NativeOp`s panic rather than silently
//! miscompiling, since any gap here is a bug in this backend, not a
//! legitimate "unsupported" outcome (those are rejected earlier, in
//! `crate::mergepoints`/`crate::bytecode`).

use super::{Isa, NativeOp};
use crate::entities::RegId;
use crate::regalloc::RegisterFile;

/// `rax`, `rcx`, `rdx`, `rbx`, `rsi`, `rdi`, `r8`-`r15`, System V callee-saved
/// registers first so the rotation in `crate::regalloc` favors them, per
/// `spec.md` §4.10.
pub struct X86_64;

const CALLEE_SAVED: [u16; 5] = [3, 6, 7, 12, 13]; // rbx, rsi, rdi, r12, r13 (illustrative ordering)
const CALLER_SAVED: [u16; 6] = [0, 1, 2, 8, 9, 10]; // rax, rcx, rdx, r8, r9, r10

impl Isa for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
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
            NativeOp::LoadImmediate { dst, value } => {
                let mut bytes = vec![0x48, 0xb8 + reg_low3(*dst)];
                bytes.extend_from_slice(&value.to_le_bytes());
                bytes
            }
            NativeOp::Move { dst, src } => {
                vec![0x48, 0x89, modrm(*src, *dst)]
            }
            NativeOp::Spill { src, to } => {
                let mut bytes = vec![0x48, 0x89, 0x85 | (reg_low3(*src) << 3)];
                bytes.extend_from_slice(&(*to as i32).to_le_bytes());
                bytes
            }
            NativeOp::Reload { dst, from } => {
                let mut bytes = vec![0x48, 0x8b, 0x85 | (reg_low3(*dst) << 3)];
                bytes.extend_from_slice(&(*from as i32).to_le_bytes());
                bytes
            }
            NativeOp::AddImmediate { dst, value } => {
                let mut bytes = vec![0x48, 0x81, 0xc0 | reg_low3(*dst)];
                bytes.extend_from_slice(&(*value as i32).to_le_bytes());
                bytes
            }
            NativeOp::Add { dst, src } => {
                vec![0x48, 0x01, modrm(*src, *dst)]
            }
            NativeOp::CompareImmediate { reg, value } => {
                let mut bytes = vec![0x48, 0x81, 0xf8 | reg_low3(*reg)];
                bytes.extend_from_slice(&(*value as i32).to_le_bytes());
                bytes
            }
            NativeOp::JumpIfNotEqual { target } => {
                let mut bytes = vec![0x0f, 0x85];
                bytes.extend_from_slice(&(*target as i32).to_le_bytes());
                bytes
            }
            NativeOp::Jump { target } => {
                let mut bytes = vec![0xe9];
                bytes.extend_from_slice(&(*target as i32).to_le_bytes());
                bytes
            }
            NativeOp::JumpToBuffer { .. } => vec![0xe9, 0x00, 0x00, 0x00, 0x00],
            NativeOp::Call { address } => {
                let mut bytes = vec![0xe8];
                bytes.extend_from_slice(&(*address as i32).to_le_bytes());
                bytes
            }
            NativeOp::Return => vec![0xc3],
        }
    }
}

fn reg_low3(reg: RegId) -> u8 {
    (reg.0 & 0x7) as u8
}

fn modrm(src: RegId, dst: RegId) -> u8 {
    0xc0 | (reg_low3(src) << 3) | reg_low3(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_return_as_single_byte() {
        let isa = X86_64;
        assert_eq!(isa.encode(&NativeOp::Return), vec![0xc3]);
    }

    #[test]
    fn load_immediate_carries_the_full_64_bit_value() {
        let isa = X86_64;
        let bytes = isa.encode(&NativeOp::LoadImmediate {
            dst: RegId(0),
            value: 42,
        });
        assert_eq!(&bytes[2..], &42i64.to_le_bytes());
    }
}
