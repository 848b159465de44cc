//! The external interfaces `spec.md` §6 describes: the two compile entry
//! points a host actually calls, and the proxy-object helper for wrapping
//! a host function so it can be called the same way a specialized
//! function is.

use crate::bytecode::Decoder;
use crate::compiler::{Compiler, FunctionId};
use crate::dispatch::{CompileOutcome, OpcodeHandler};
use crate::entities::{BytecodeOffset, CodeBufferRef, VinfoRef};
use crate::error::CompileError;
use crate::snapshot::SpecRegistry;
use crate::vinfo::VinfoGraph;

/// Compile a whole code object from its first instruction
/// (`spec.md` §6 "`compile_code(code_object, globals, recursion_limit,
/// is_module) -> Option<CodeBuffer>`").
///
/// `Ok(None)` means this function cannot be specialized for a reason
/// `spec.md` §6 says should fall back to the interpreter without
/// surfacing an error to the host (unsupported opcode, generator,
/// `**kwargs`, free/cell vars, recursion limit, or a host filter
/// rejection) — `is_module` and the recursion limit are folded into
/// `registry`/`initial_locals` by the caller, since this crate has no
/// opinion on what either looks like on the host side.
#[allow(clippy::too_many_arguments)]
pub fn compile_code<D: Decoder>(
    compiler: &Compiler,
    id: FunctionId,
    decoder: &D,
    handler: &mut impl OpcodeHandler<D::Instr>,
    registry: &dyn SpecRegistry,
    initial_locals: Vec<VinfoRef>,
    graph: VinfoGraph,
) -> Result<Option<CodeBufferRef>, CompileError> {
    match compiler.compile_function(id, decoder, handler, registry, initial_locals, graph)? {
        CompileOutcome::Compiled(buf) => Ok(Some(buf)),
        CompileOutcome::Unsupported(reason) => {
            log::debug!("compile_code: {id:?} not specialized: {reason}");
            Ok(None)
        }
    }
}

/// Compile starting partway through a function, using a running frame's
/// local slots as runtime inputs (`spec.md` §6 "`compile_frame(running_frame,
/// recursion_limit) -> Option<CodeBuffer>`... compiles starting from the
/// middle of a function using the frame's local slots as runtime
/// inputs").
///
/// `initial_locals` must already hold one `VinfoRef` per local slot the
/// frame has live at `start_offset`, sourced from the caller's running
/// interpreter frame; this crate has no way to read a host frame's
/// locals itself.
#[allow(clippy::too_many_arguments)]
pub fn compile_frame<D: Decoder>(
    compiler: &Compiler,
    id: FunctionId,
    decoder: &D,
    handler: &mut impl OpcodeHandler<D::Instr>,
    registry: &dyn SpecRegistry,
    initial_locals: Vec<VinfoRef>,
    graph: VinfoGraph,
    start_offset: BytecodeOffset,
) -> Result<Option<CodeBufferRef>, CompileError> {
    match compiler.compile_function_from(id, decoder, handler, registry, initial_locals, graph, start_offset)? {
        CompileOutcome::Compiled(buf) => Ok(Some(buf)),
        CompileOutcome::Unsupported(reason) => {
            log::debug!("compile_frame: {id:?} from {start_offset} not specialized: {reason}");
            Ok(None)
        }
    }
}

/// Builds a host-side "proxy object" for a function this crate compiled:
/// a trivial bytecode of the form "load-two-fast; star-call; return"
/// wrapping a call to the specialized target, so the rest of the host
/// can keep treating it as an ordinary callable (`spec.md` §6 "Proxy
/// object for a host function").
///
/// `CodeObject` is the host's own representation of a callable; this
/// crate never constructs one, it only names the shape the host needs to
/// build.
pub trait ProxyObjectBuilder {
    type CodeObject;

    /// Build a proxy that, when called by the host's interpreter with
    /// the wrapped function's own arity, directly enters `target`
    /// instead of reinterpreting the original bytecode.
    fn build_proxy(&self, target: FunctionId, buffer: CodeBufferRef) -> Self::CodeObject;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, InstructionClass};
    use crate::compiler::Compiler;
    use crate::error::ControlSignal;
    use crate::isa::x86_64::X86_64;
    use crate::settings::Settings;
    use crate::source::VirtualSpec;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Instr {
        offset: BytecodeOffset,
        class: InstructionClass,
        targets: Vec<BytecodeOffset>,
        mnemonic: &'static str,
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
        fn mnemonic(&self) -> &str {
            self.mnemonic
        }
    }

    struct SingleReturn;
    impl Decoder for SingleReturn {
        type Instr = Instr;
        fn decode_all(&self) -> Vec<Instr> {
            vec![Instr {
                offset: BytecodeOffset(0),
                class: InstructionClass::Light,
                targets: vec![],
                mnemonic: "return_value",
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

    struct ReturnHandler;
    impl OpcodeHandler<Instr> for ReturnHandler {
        fn handle(
            &mut self,
            ctx: &mut crate::dispatch::DispatchContext,
            _instr: &Instr,
        ) -> Result<ControlSignal, CompileError> {
            ctx.emitter.emit(&crate::isa::NativeOp::Return)?;
            let v = ctx.graph.new_known_integer(9);
            Ok(ControlSignal::Return(v))
        }
    }

    struct NoSpecs;
    impl SpecRegistry for NoSpecs {
        fn lookup(&self, _name: &str) -> Option<Arc<dyn VirtualSpec>> {
            None
        }
    }

    #[test]
    fn compile_code_returns_some_buffer_when_the_function_specializes() {
        let compiler = Compiler::new(Box::new(X86_64), Settings::default());
        let id = FunctionId(1);
        let result = compile_code(&compiler, id, &SingleReturn, &mut ReturnHandler, &NoSpecs, Vec::new(), VinfoGraph::new());
        assert!(matches!(result, Ok(Some(_))));
    }

    #[test]
    fn compile_frame_downgrades_unsupported_to_none_instead_of_an_error() {
        struct Generator;
        impl Decoder for Generator {
            type Instr = Instr;
            fn decode_all(&self) -> Vec<Instr> {
                vec![Instr {
                    offset: BytecodeOffset(0),
                    class: InstructionClass::Light,
                    targets: vec![],
                    mnemonic: "return_value",
                }]
            }
            fn has_double_star_kwargs(&self) -> bool {
                false
            }
            fn has_free_or_cell_vars(&self) -> bool {
                true
            }
            fn local_count(&self) -> u32 {
                1
            }
        }
        let compiler = Compiler::new(Box::new(X86_64), Settings::default());
        let id = FunctionId(2);
        let result = compile_frame(
            &compiler,
            id,
            &Generator,
            &mut ReturnHandler,
            &NoSpecs,
            Vec::new(),
            VinfoGraph::new(),
            BytecodeOffset(0),
        );
        assert_eq!(result.unwrap(), None);
    }
}
