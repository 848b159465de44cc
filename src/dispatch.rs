//! Main opcode dispatch loop: the driver that walks one function's
//! bytecode, maintains the live `vinfo` graph, and at each merge point
//! decides reuse, partial reuse, or fresh specialization (`spec.md` §2
//! "Data flow", §4.4, §4.5).
//!
//! Per-opcode semantic handlers are an external collaborator, like
//! `crate::bytecode::Decoder` and `crate::isa::Isa`: this module specifies
//! only the contract (`OpcodeHandler`), not any particular host language's
//! opcodes.

use crate::bytecode::{Decoder, Instruction, InstructionClass};
use crate::compat::{self, Match};
use crate::emit::Emitter;
use crate::entities::{BytecodeOffset, CodeBufferRef, ProxyRef, SnapshotRef, VinfoRef};
use crate::error::{CompileError, ControlSignal, UnsupportedReason};
use crate::isa::Isa;
use crate::mergepoints::{self, MergePointTable};
use crate::metaops::MetaOpTable;
use crate::promote::{PromotionFlavor, PromotionRequest, PromotionStub};
use crate::regalloc::RegisterAllocator;
use crate::respawn::{ProxyTable, RespawnCursor};
use crate::settings::Settings;
use crate::snapshot::{Snapshot, SpecRegistry};
use crate::source::Source;
use crate::unify::{self, Location};
use crate::vinfo::VinfoGraph;
use cranelift_entity::PrimaryMap;
use log::{debug, trace};

/// What a single call into `compile` produced.
#[derive(Debug)]
pub enum CompileOutcome {
    /// A runnable buffer was emitted.
    Compiled(CodeBufferRef),
    /// The function cannot be specialized; the caller should route to the
    /// interpreter (`spec.md` §6 "Returns `None`... unsupported").
    Unsupported(UnsupportedReason),
}

/// Owns every frozen snapshot recorded for one function, addressed by the
/// `SnapshotRef`s a `MergePoint` carries (`spec.md` §3 "MergePoint...
/// entries: Vec<CodeBufferRef>" — generalized here to full snapshots
/// rather than bare code-buffer refs, since a merge point's entries also
/// need their compressed state for `compat::compatible`).
#[derive(Default)]
pub struct SnapshotStore {
    snapshots: PrimaryMap<SnapshotRef, Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore {
            snapshots: PrimaryMap::new(),
        }
    }

    pub fn insert(&mut self, snapshot: Snapshot) -> SnapshotRef {
        self.snapshots.push(snapshot)
    }

    pub fn get(&self, r: SnapshotRef) -> &Snapshot {
        &self.snapshots[r]
    }

    pub fn get_mut(&mut self, r: SnapshotRef) -> &mut Snapshot {
        &mut self.snapshots[r]
    }
}

/// Per-function compile-time bookkeeping that survives across separate
/// calls to `compile` (one per eventual respawn/promotion target),
/// distinct from the per-compile `VinfoGraph` (`spec.md` §5 "Shared
/// resources... Merge-point entries").
#[derive(Default)]
pub struct FunctionState {
    pub merge_points: MergePointTable,
    pub snapshots: SnapshotStore,
    pub promotions: Vec<PromotionStub>,
    pub proxies: ProxyTable,
}

/// Mutable state threaded through one call to an `OpcodeHandler`: the
/// live symbolic graph, the current locals (fixed slots, then per-opcode
/// locals and evaluation stack per `spec.md` §3 `CompilerState.locals`),
/// and everything needed to emit code for this instruction.
pub struct DispatchContext<'a> {
    pub graph: VinfoGraph,
    pub locals: Vec<VinfoRef>,
    pub stack_depth: u32,
    pub regs: RegisterAllocator,
    pub respawn: RespawnCursor,
    pub metaops: &'a MetaOpTable,
    pub emitter: Emitter<'a>,
}

impl<'a> DispatchContext<'a> {
    /// Read a boolean flag, resolving it if it's already a compile-time
    /// constant or else signalling the caller to suspend emission and let
    /// the promotion machinery install a respawn point for it
    /// (`runtime_condition_t`/`_f` in `dispatcher.h`).
    ///
    /// `expect_true` is the branch the caller is optimizing for; it has no
    /// effect on which `Ok` value comes back, only on what gets traced
    /// when a resolved flag disagrees with it. A handler that would
    /// otherwise hand-roll `ControlSignal::Promote(PromotionRequest::new(cond,
    /// PromotionFlavor::Integer))` on every unknown flag can use this
    /// instead:
    ///
    /// ```ignore
    /// let truth = match ctx.runtime_condition(flag, true) {
    ///     Ok(b) => b,
    ///     Err(signal) => return Ok(signal),
    /// };
    /// ```
    pub fn runtime_condition(&self, cond: VinfoRef, expect_true: bool) -> Result<bool, ControlSignal> {
        match &self.graph.get(cond).source {
            Source::CompileTime(ct) => {
                let actual = ct.known.value != 0;
                if actual != expect_true {
                    trace!(
                        "runtime_condition on {cond} resolved to {actual}, against the {expect_true} expectation"
                    );
                }
                Ok(actual)
            }
            _ => Err(ControlSignal::Promote(PromotionRequest::new(cond, PromotionFlavor::Integer))),
        }
    }
}

/// One host-language opcode's compile-time semantics. An external
/// collaborator (`spec.md` §2): this crate only specifies the shape of
/// the call, not any instruction set.
pub trait OpcodeHandler<I: Instruction> {
    fn handle(
        &mut self,
        ctx: &mut DispatchContext,
        instr: &I,
    ) -> Result<ControlSignal, CompileError>;
}

/// Compile one function from its decoded bytecode, driving `handler` over
/// each instruction and consulting `state`'s merge-point table at
/// confluences (`spec.md` §2 "Data flow").
///
/// `initial_locals` seeds `DispatchContext::locals` (globals, a
/// continuation slot, an inlining slot, then per-opcode locals, per
/// `spec.md` §3's `CompilerState.locals` layout); the caller is
/// responsible for binding each to a `Source` appropriate to what is
/// statically known about it.
#[allow(clippy::too_many_arguments)]
pub fn compile<D: Decoder>(
    decoder: &D,
    handler: &mut impl OpcodeHandler<D::Instr>,
    isa: &dyn Isa,
    buffers: &mut crate::codebuf::CodeBufferManager,
    metaops: &MetaOpTable,
    registry: &dyn SpecRegistry,
    settings: &Settings,
    state: &mut FunctionState,
    initial_locals: Vec<VinfoRef>,
    graph: VinfoGraph,
) -> Result<CompileOutcome, CompileError> {
    compile_from(
        decoder,
        handler,
        isa,
        buffers,
        metaops,
        registry,
        settings,
        state,
        initial_locals,
        graph,
        BytecodeOffset(0),
    )
}

/// Like `compile`, but starts emission partway through the bytecode
/// instead of at offset 0 — what `crate::api::compile_frame` needs to
/// compile starting from a running frame's current position (`spec.md`
/// §6 "Compiles starting from the middle of a function using the frame's
/// local slots as runtime inputs").
#[allow(clippy::too_many_arguments)]
pub fn compile_from<D: Decoder>(
    decoder: &D,
    handler: &mut impl OpcodeHandler<D::Instr>,
    isa: &dyn Isa,
    buffers: &mut crate::codebuf::CodeBufferManager,
    metaops: &MetaOpTable,
    registry: &dyn SpecRegistry,
    settings: &Settings,
    state: &mut FunctionState,
    initial_locals: Vec<VinfoRef>,
    graph: VinfoGraph,
    start_offset: BytecodeOffset,
) -> Result<CompileOutcome, CompileError> {
    if decoder.has_double_star_kwargs() {
        return Ok(CompileOutcome::Unsupported(UnsupportedReason::HasDoubleStarKwargs));
    }
    if decoder.has_free_or_cell_vars() {
        return Ok(CompileOutcome::Unsupported(UnsupportedReason::HasFreeOrCellVars));
    }

    let instrs = decoder.decode_all();
    if let Some(instr) = instrs.iter().find(|i| i.is_generator_yield()) {
        debug!("rejecting function: generator yield at {}", instr.offset());
        return Ok(CompileOutcome::Unsupported(UnsupportedReason::IsGenerator));
    }

    let Some(start_index) = instrs.iter().position(|i| i.offset() == start_offset) else {
        return Err(CompileError::InvariantViolation(format!(
            "start offset {start_offset} is not an instruction boundary"
        )));
    };

    if !state.merge_points.flags.contains(mergepoints::FunctionFlags::CONTROL_FLOW_ANALYZED) {
        state.merge_points = mergepoints::analyze(&instrs, decoder.local_count(), settings);
    }

    let buf = buffers.new_slab();
    let mut ctx = DispatchContext {
        graph,
        locals: initial_locals,
        stack_depth: 0,
        regs: RegisterAllocator::new(isa.register_file()),
        respawn: RespawnCursor::idle(),
        metaops,
        emitter: Emitter::new(isa, buffers, buf),
    };

    // `spec.md` §4.7 "Detection": landing exactly on a pending coding-pause
    // proxy's offset is a respawn, not a fresh compile. The frozen snapshot
    // is self-contained, so replaying the proxy chain only needs to drive
    // the cursor through its ancestor hops for bookkeeping/tracing before
    // restoring state directly from `frozen_state` — there is no
    // intermediate bytecode to re-emit, unlike a chain whose snapshots only
    // captured a diff.
    let mut active_proxy: Option<ProxyRef> = None;
    if let Some(proxy_ref) = state.proxies.find_unfired_at(start_offset) {
        let chain = state.proxies.replay_chain(proxy_ref);
        let steps = (chain.len() - 1) as u32;
        if steps > 0 {
            ctx.respawn = RespawnCursor::begin(steps);
            while !ctx.respawn.step() {}
        }
        let proxy = state.proxies.get(proxy_ref);
        debug!(
            "respawning at {start_offset} via a {}-link proxy chain",
            chain.len()
        );
        ctx.locals = proxy.frozen_state.unfreeze(&mut ctx.graph, registry);
        ctx.stack_depth = proxy.frozen_state.stack_depth;
        active_proxy = Some(proxy_ref);
    }

    let mut index = start_index;
    while index < instrs.len() {
        let instr = &instrs[index];
        let offset = instr.offset();

        if state.merge_points.lookup(offset).is_some() {
            match try_reuse(&mut ctx, state, offset, registry, settings)? {
                Some(target) => {
                    ctx.emitter.shrink_current();
                    if let Some(proxy_ref) = active_proxy {
                        state.proxies.mark_fired(proxy_ref, target);
                    }
                    return Ok(CompileOutcome::Compiled(target));
                }
                None => record_snapshot(&mut ctx, state, offset, settings),
            }
        }

        let signal = handler.handle(&mut ctx, instr)?;
        if instr.class() == InstructionClass::Branch {
            install_proxy_for_untaken_branch(&mut ctx, state, &instrs, index, &signal, active_proxy, settings);
        }

        match signal {
            ControlSignal::Continue => {
                index += 1;
            }
            ControlSignal::Jump(target) => {
                let Some(next_index) = instrs.iter().position(|i| i.offset() == target) else {
                    return Err(CompileError::InvariantViolation(format!(
                        "jump target {target} is not an instruction boundary"
                    )));
                };
                index = next_index;
            }
            ControlSignal::Return(_v) => {
                ctx.emitter.shrink_current();
                let buf = ctx.emitter.current_buffer();
                if let Some(proxy_ref) = active_proxy {
                    state.proxies.mark_fired(proxy_ref, buf);
                }
                return Ok(CompileOutcome::Compiled(buf));
            }
            ControlSignal::Promote(req) => {
                let roots: Vec<VinfoRef> = ctx.locals.clone();
                let frozen = Snapshot::compress(&ctx.graph, &roots, ctx.stack_depth, settings);
                let stub = PromotionStub::new(req.vinfo, req.flavor, frozen, settings.megamorphic_max);
                debug!(
                    "promotion requested on {} at {offset}; suspending emission",
                    req.vinfo
                );
                state.promotions.push(stub);
                ctx.emitter.shrink_current();
                let buf = ctx.emitter.current_buffer();
                if let Some(proxy_ref) = active_proxy {
                    state.proxies.mark_fired(proxy_ref, buf);
                }
                return Ok(CompileOutcome::Compiled(buf));
            }
            ControlSignal::Break | ControlSignal::ContinueLoop => {
                return Err(CompileError::InvariantViolation(format!(
                    "loop control signal reached dispatch with no enclosing loop at {offset}"
                )));
            }
            ControlSignal::InlineIntoParent => {
                return Err(CompileError::InvariantViolation(format!(
                    "inline-into-parent reached top-level dispatch at {offset}"
                )));
            }
            ControlSignal::HostException { exc, value } => {
                let exc_source = ctx.graph.get(exc).source.clone();
                let value_source = ctx.graph.get(value).source.clone();
                return Err(CompileError::HostException(crate::error::HostExceptionValue {
                    exc_source,
                    value_source,
                }));
            }
        }
    }

    Err(CompileError::InvariantViolation(
        "fell off the end of the bytecode without a terminal control signal".to_string(),
    ))
}

/// After a `Branch`-class instruction resolves which way it went, freeze
/// the *other* direction as a coding-pause proxy so it can be compiled
/// lazily the first time something actually reaches it (`spec.md` §4.7).
/// A direction that already has a pending proxy is left alone.
fn install_proxy_for_untaken_branch<I: Instruction>(
    ctx: &mut DispatchContext,
    state: &mut FunctionState,
    instrs: &[I],
    index: usize,
    signal: &ControlSignal,
    active_proxy: Option<ProxyRef>,
    settings: &Settings,
) {
    let branch_target = instrs[index].targets().first().copied();
    let fallthrough = instrs.get(index + 1).map(|i| i.offset());

    let untaken = match signal {
        ControlSignal::Continue => branch_target,
        ControlSignal::Jump(target) if Some(*target) == branch_target => fallthrough,
        _ => None,
    };
    let Some(untaken) = untaken else { return };
    if state.proxies.find_unfired_at(untaken).is_some() {
        return;
    }

    let roots = ctx.locals.clone();
    let frozen = Snapshot::compress(&ctx.graph, &roots, ctx.stack_depth, settings);
    debug!("installing coding-pause proxy for the untaken branch direction at {untaken}");
    state.proxies.insert(untaken, frozen, active_proxy);
}

/// Attempt to reuse an existing snapshot at this merge point: exact match
/// unifies directly; a partial match un-promotes its diff and retries
/// once (`spec.md` §4.5 last paragraph); anything else is reported as "no
/// match" to the caller.
fn try_reuse(
    ctx: &mut DispatchContext,
    state: &mut FunctionState,
    offset: BytecodeOffset,
    registry: &dyn SpecRegistry,
    settings: &Settings,
) -> Result<Option<CodeBufferRef>, CompileError> {
    let snapshot_refs: Vec<SnapshotRef> = state
        .merge_points
        .lookup(offset)
        .map(|mp| mp.snapshots.clone())
        .unwrap_or_default();
    if snapshot_refs.is_empty() {
        return Ok(None);
    }

    let candidates: Vec<(SnapshotRef, &Snapshot)> = snapshot_refs
        .iter()
        .map(|&r| (r, state.snapshots.get(r)))
        .collect();

    let Some(m) = compat::compatible(&ctx.graph, &ctx.locals, &candidates, registry) else {
        return Ok(None);
    };

    let m = if m.is_exact() {
        Some(m)
    } else {
        un_promote_and_retry(ctx, m, &candidates, registry)?
    };

    let Some(m) = m else { return Ok(None) };
    apply_unify(ctx, state, &m, registry)?;
    trace!("merge point at {offset} reused snapshot {}", m.entry);
    Ok(state.snapshots.get(m.entry).entry_point)
}

/// Un-promote every vinfo in `m.diff` back to run-time, then re-run the
/// compatibility check once against the same candidates (`spec.md` §4.5
/// "the compatibility check is restarted from the updated state").
///
/// Slots are handed out as fresh stack offsets rather than routed through
/// `crate::regalloc`: un-promotion here is a narrow fallback path, and a
/// full register-aware allocation would need the same double-mutable-
/// borrow of `ctx.regs` and `ctx.emitter` that `crate::unify::unify`'s
/// own step 5 already defers to the allocator proper.
fn un_promote_and_retry(
    ctx: &mut DispatchContext,
    m: Match,
    candidates: &[(SnapshotRef, &Snapshot)],
    registry: &dyn SpecRegistry,
) -> Result<Option<Match>, CompileError> {
    let diff = m.diff;
    let mut next_offset = ctx.stack_depth;
    unify::unpromote_diff(&mut ctx.graph, &diff, &mut ctx.emitter, || {
        let off = next_offset;
        next_offset += 8;
        Location::Stack(off)
    })?;
    ctx.stack_depth = next_offset;

    match compat::compatible(&ctx.graph, &ctx.locals, candidates, registry) {
        Some(retried) if retried.is_exact() => Ok(Some(retried)),
        _ => Ok(None),
    }
}

fn apply_unify(
    ctx: &mut DispatchContext,
    state: &FunctionState,
    m: &Match,
    registry: &dyn SpecRegistry,
) -> Result<(), CompileError> {
    let snapshot = state.snapshots.get(m.entry);
    let live_depth = ctx.stack_depth;
    unify::unify(&mut ctx.graph, &ctx.locals, m, snapshot, registry, live_depth, &mut ctx.emitter)
}

/// Freeze the live state reached at `offset` as a new snapshot entry.
///
/// Its `entry_point` is set to the buffer currently being emitted into:
/// forward compilation continues right here, so a future exact match
/// against this entry should jump back to this same buffer rather than
/// leaving `entry_point` unset (which would make the entry permanently
/// unreusable and defeat the O(1)-specializations property at loop merge
/// points, `spec.md` §8 scenario 3).
fn record_snapshot(ctx: &mut DispatchContext, state: &mut FunctionState, offset: BytecodeOffset, settings: &Settings) {
    let roots = ctx.locals.clone();
    let snapshot = Snapshot::compress(&ctx.graph, &roots, ctx.stack_depth, settings);
    let snap_ref = state.snapshots.insert(snapshot);
    state.snapshots.get_mut(snap_ref).entry_point = Some(ctx.emitter.current_buffer());
    if let Some(mp) = state.merge_points.lookup_mut(offset) {
        mp.snapshots.push(snap_ref);
    }
}
