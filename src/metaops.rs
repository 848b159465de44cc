//! Meta-operations: compile-time emulation of host runtime primitives
//! (`spec.md` §4.9), plus the error-propagation conventions native calls
//! are tagged with (`spec.md` §4.9 last paragraph, §6 "Error kinds at
//! call boundaries").

use crate::entities::VinfoRef;
use crate::error::CompileError;
use crate::vinfo::VinfoGraph;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// The address of a host runtime primitive, used as the meta-op table's
/// key (`spec.md` §4.9 "a global table keyed by primitive address").
///
/// An address rather than a name because the host binds callables to
/// meta-ops dynamically, by "discovering their callable members"; two
/// different names can resolve to the same primitive (aliasing), and the
/// table must treat them identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrimitiveAddress(pub usize);

/// How a native call's result must be checked for an error before
/// continuing, tagged per call site (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorConvention {
    /// No check: the callee cannot fail.
    None,
    /// An error is signaled by a null return.
    CheckNull,
    /// An error is signaled by a negative return.
    CheckNegative,
    /// An error is signaled by a nonzero return.
    CheckNonzero,
    /// An error is signaled by exactly `-1`.
    CheckMinus1,
    /// The call always raises; the caller never resumes.
    CheckAlways,
    /// `-1` is ambiguous with a valid result; a side flag must be
    /// consulted too.
    CheckMinus1OrFlag,
    /// As `CheckNegative`, but also consult a side flag for ambiguous
    /// results.
    CheckNegativeOrFlag,
    /// Callee returns a sentinel meaning "operation not implemented for
    /// these operand types"; caller falls back to a different path.
    CheckNotImplemented,
    /// Iterator-protocol convention: a null return may mean
    /// exhaustion (success) or an actual error, disambiguated by a
    /// side channel.
    CheckIterNext,
    /// Alias for `CheckAlways` used at a handful of call sites in the
    /// original that distinguish "always raises" from "always fails
    /// this particular call" only in diagnostics; behaviorally
    /// identical here.
    Always,
}

/// A compile-time emulation of one host runtime primitive.
///
/// `call` returns `Ok(None)` when the meta-op declines to handle these
/// particular arguments (e.g. operand types it doesn't special-case),
/// signaling the generic call operator to fall back to a real native
/// call (`spec.md` §4.9 "if present and arguments are suitable, invoke
/// the meta-op; otherwise, emit a regular native call").
pub trait MetaOp: Send + Sync {
    fn name(&self) -> &str;

    fn call(
        &self,
        graph: &mut VinfoGraph,
        args: &[VinfoRef],
    ) -> Result<Option<VinfoRef>, CompileError>;

    /// The error-checking convention a real native call to this
    /// primitive would need, for the fallback path.
    fn error_convention(&self) -> ErrorConvention {
        ErrorConvention::CheckNull
    }
}

/// The global table mapping primitive addresses to their meta-ops
/// (`spec.md` §4.9). Shared across threads behind `Compiler`'s lock
/// (`spec.md` §5 "Host global lock").
#[derive(Default)]
pub struct MetaOpTable {
    table: FxHashMap<PrimitiveAddress, Arc<dyn MetaOp>>,
}

impl MetaOpTable {
    pub fn new() -> Self {
        MetaOpTable {
            table: FxHashMap::default(),
        }
    }

    /// Bind `op` to `address`, as the host does when "discovering
    /// [a module's] callable members and binding a meta-op per
    /// callable".
    pub fn register(&mut self, address: PrimitiveAddress, op: Arc<dyn MetaOp>) {
        self.table.insert(address, op);
    }

    pub fn lookup(&self, address: PrimitiveAddress) -> Option<Arc<dyn MetaOp>> {
        self.table.get(&address).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// The general call operator: try the meta-op table first, leaving
    /// "emit a regular native call" to the caller when this returns
    /// `Ok(None)` (`spec.md` §4.9, first paragraph).
    pub fn try_call(
        &self,
        address: PrimitiveAddress,
        graph: &mut VinfoGraph,
        args: &[VinfoRef],
    ) -> Result<Option<VinfoRef>, CompileError> {
        match self.lookup(address) {
            Some(op) => op.call(graph, args),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstFoldAdd;
    impl MetaOp for ConstFoldAdd {
        fn name(&self) -> &str {
            "int.__add__"
        }
        fn call(
            &self,
            graph: &mut VinfoGraph,
            args: &[VinfoRef],
        ) -> Result<Option<VinfoRef>, CompileError> {
            if args.len() != 2 {
                return Ok(None);
            }
            let vals: Option<Vec<i64>> = args
                .iter()
                .map(|&v| match &graph.get(v).source {
                    crate::source::Source::CompileTime(ct) if ct.known.fixed => Some(ct.known.value),
                    _ => None,
                })
                .collect();
            let Some(vals) = vals else { return Ok(None) };
            let sum = graph.new_known_integer(vals[0] + vals[1]);
            Ok(Some(sum))
        }
    }

    #[test]
    fn unregistered_primitive_falls_back_to_native_call() {
        let table = MetaOpTable::new();
        let mut graph = VinfoGraph::new();
        let a = graph.new_known_integer(1);
        let result = table
            .try_call(PrimitiveAddress(0x1000), &mut graph, &[a])
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn registered_metaop_constant_folds_when_both_args_fixed() {
        let mut table = MetaOpTable::new();
        table.register(PrimitiveAddress(0x2000), Arc::new(ConstFoldAdd));
        let mut graph = VinfoGraph::new();
        let a = graph.new_known_integer(2);
        let b = graph.new_known_integer(3);
        let result = table
            .try_call(PrimitiveAddress(0x2000), &mut graph, &[a, b])
            .unwrap()
            .expect("both args fixed, should fold");
        match &graph.get(result).source {
            crate::source::Source::CompileTime(ct) => assert_eq!(ct.known.value, 5),
            _ => panic!("expected compile-time fold result"),
        }
    }

    #[test]
    fn registered_metaop_declines_non_fixed_args() {
        let mut table = MetaOpTable::new();
        table.register(PrimitiveAddress(0x2000), Arc::new(ConstFoldAdd));
        let mut graph = VinfoGraph::new();
        let a = graph.new_dummy();
        let b = graph.new_known_integer(3);
        let result = table
            .try_call(PrimitiveAddress(0x2000), &mut graph, &[a, b])
            .unwrap();
        assert!(result.is_none());
    }
}
