//! A minimal bytecode fixture standing in for the external decoder
//! collaborator (`SPEC_FULL.md` §2.4), shared by the integration tests.

use vcompile::bytecode::{Decoder, Instruction, InstructionClass};
use vcompile::entities::BytecodeOffset;

#[derive(Debug, Clone)]
pub struct Instr {
    pub offset: BytecodeOffset,
    pub class: InstructionClass,
    pub targets: Vec<BytecodeOffset>,
    pub mnemonic: &'static str,
    pub is_yield: bool,
}

impl Instruction for Instr {
    fn offset(&self) -> BytecodeOffset {
        self.offset
    }
    fn class(&self) -> InstructionClass {
        self.class
    }
    fn targets(&self) -> &[BytecodeOffset] {
        &self.targets
    }
    fn is_generator_yield(&self) -> bool {
        self.is_yield
    }
    fn mnemonic(&self) -> &str {
        self.mnemonic
    }
}

fn light(offset: u32, mnemonic: &'static str) -> Instr {
    Instr {
        offset: BytecodeOffset(offset),
        class: InstructionClass::Light,
        targets: vec![],
        mnemonic,
        is_yield: false,
    }
}

/// `def f(x): return x + 1` — two light instructions, no branches.
pub struct AddOneFunction;

impl Decoder for AddOneFunction {
    type Instr = Instr;
    fn decode_all(&self) -> Vec<Instr> {
        vec![light(0, "load_fast_add_const"), light(4, "return_value")]
    }
    fn has_double_star_kwargs(&self) -> bool {
        false
    }
    fn has_free_or_cell_vars(&self) -> bool {
        false
    }
    fn local_count(&self) -> u32 {
        1
    }
}

/// A function whose body contains a `yield`, unsupported per
/// `UnsupportedReason::IsGenerator`.
pub struct GeneratorFunction;

impl Decoder for GeneratorFunction {
    type Instr = Instr;
    fn decode_all(&self) -> Vec<Instr> {
        vec![Instr {
            offset: BytecodeOffset(0),
            class: InstructionClass::Light,
            targets: vec![],
            mnemonic: "yield_value",
            is_yield: true,
        }]
    }
    fn has_double_star_kwargs(&self) -> bool {
        false
    }
    fn has_free_or_cell_vars(&self) -> bool {
        false
    }
    fn local_count(&self) -> u32 {
        1
    }
}

pub struct NoSpecs;
impl vcompile::snapshot::SpecRegistry for NoSpecs {
    fn lookup(&self, _name: &str) -> Option<std::sync::Arc<dyn vcompile::source::VirtualSpec>> {
        None
    }
}
