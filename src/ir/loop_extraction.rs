//! The loop-extraction pass (§4.1): clones a canonical outermost loop's body
//! into a standalone function, marshals its live-ins into a heap cell, and
//! replaces the loop with a call to the runtime dispatcher. Mirrors
//! `LoopExtractionPass::cloneLoopAndRemap` in the original plugin, operating
//! over [`crate::ir`]'s in-crate model instead of real LLVM IR.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument};

use crate::error::CompileError;

use super::scev::{self, CanonicalLoop};
use super::verify;
use super::{operands, BasicBlock, BlockId, Callee, Function, FunctionId, Instruction, Module, RuntimeHook, Terminator, Value, ValueId};

/// The functions produced by extracting one loop: always a parallel body,
/// and -- only when the loop being extracted is itself already a generated
/// body (a nested loop) -- a sequential fallback and a continuation, per
/// §4.1's "emit sequential+continuation only when re-entering a generated
/// body".
#[derive(Debug, Clone, Copy)]
pub struct ExtractedJob {
    pub parallel: FunctionId,
    pub sequential: Option<FunctionId>,
    pub continuation: Option<FunctionId>,
}

pub struct LoopExtractionPass<'m> {
    module: &'m mut Module,
}

impl<'m> LoopExtractionPass<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        LoopExtractionPass { module }
    }

    /// Run over every loop the function declares. Per-loop transform
    /// failures are recoverable (the loop is left untouched); a fatal
    /// failure aborts the whole run for this function, matching §7.
    #[instrument(skip(self))]
    pub fn run(&mut self, function_id: FunctionId) -> Result<Vec<ExtractedJob>, CompileError> {
        if self.module.is_preserved(function_id) {
            debug!(function = function_id.0, "function is preserved, skipping");
            return Ok(Vec::new());
        }

        let loops = self.module.function(function_id).loops.clone();
        if loops.is_empty() {
            debug!(function = function_id.0, "no loops in function");
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for decl in loops {
            match self.extract_loop(function_id, decl.preheader, decl.header) {
                Ok(job) => jobs.push(job),
                Err(e) if !e.is_fatal() => {
                    debug!(error = %e, "skipping loop that failed to extract");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    fn extract_loop(
        &mut self,
        function_id: FunctionId,
        preheader: BlockId,
        header: BlockId,
    ) -> Result<ExtractedJob, CompileError> {
        let name = self.module.function(function_id).name.clone();
        let canonical = scev::find_canonical_loop(self.module.function(function_id), &name, preheader, header)?;

        let is_nested = self.module.is_generated(function_id);
        let live_ins = find_live_ins(self.module.function(function_id), &canonical);

        let parallel = self.emit_extracted_body(function_id, &canonical, &live_ins, &format!("{name}ParallelLoopBody"));

        let (sequential, continuation) = if is_nested {
            let seq = self.emit_extracted_body(function_id, &canonical, &live_ins, &format!("{name}SequentialLoopBody"));
            let cont = self.emit_continuation(function_id, &canonical, &format!("{name}ContinuedLoopBody"));
            self.module.mark_generated(seq);
            self.module.mark_preserved(seq);
            self.module.mark_generated(cont);
            verify::verify_function(self.module, seq)?;
            verify::verify_function(self.module, cont)?;
            (Some(seq), Some(cont))
        } else {
            (None, None)
        };

        let scope = self.marshal_live_ins(function_id, &live_ins, canonical.preheader);
        self.emit_dispatch(function_id, &canonical, parallel, sequential, continuation, scope, is_nested);

        self.module.mark_generated(parallel);
        verify::verify_function(self.module, parallel)?;
        if is_nested {
            // The loop body now lives only in the generated functions; the
            // original header is unreachable once the preheader returns
            // void instead of branching into it.
            self.module.function_mut(function_id).blocks.retain(|b| b.id != canonical.header);
        }
        // When not nested, the header is left in place deliberately: it is
        // the sequential fallback the dispatch call's `CondBr` re-enters on
        // conflict (§4.1's dispatch-call emission, "branch to Header").

        debug!(?parallel, ?sequential, ?continuation, "extracted loop");
        Ok(ExtractedJob { parallel, sequential, continuation })
    }

    /// Clone the loop body's non-control instructions into a fresh
    /// `fn(i64, ptr) -> void`: arg 0 is the induction value, arg 1 the
    /// marshalled live-in scope. Auxiliary PHIs are expanded inline to
    /// their closed form rather than loaded from the scope, matching
    /// `expandPHINodes`/`SCEVExpander`.
    fn emit_extracted_body(
        &mut self,
        function_id: FunctionId,
        loop_: &CanonicalLoop,
        live_ins: &[u32],
        name: &str,
    ) -> FunctionId {
        let control = loop_.control_ids();
        let body_instrs: Vec<(ValueId, Instruction)> = self
            .module
            .function(function_id)
            .block(loop_.header)
            .instructions
            .iter()
            .filter(|(id, _)| !control.contains(id))
            .cloned()
            .collect();

        let new_id = self.module.declare_function(name, vec![64, 64]);
        let new_func = self.module.function_mut(new_id);
        let entry = new_func.fresh_block();

        let mut block_instrs = Vec::new();
        let mut vmap: HashMap<ValueId, Value> = HashMap::new();
        let mut loaded: HashMap<u32, Value> = HashMap::new();

        for (i, &arg) in live_ins.iter().enumerate() {
            let gep_id = new_func.fresh_value();
            block_instrs.push((
                gep_id,
                Instruction::Gep { base: Value::Arg(1), index: Value::Const(i as i64), elem_size: 8 },
            ));
            let load_id = new_func.fresh_value();
            block_instrs.push((load_id, Instruction::Load { addr: Value::Instr(gep_id), size: 8 }));
            loaded.insert(arg, Value::Instr(load_id));
        }

        for aux in &loop_.aux_phis {
            let base = remap_value(aux.base, loop_.indvar, &vmap, &loaded);
            let mul_id = new_func.fresh_value();
            block_instrs.push((mul_id, Instruction::Mul(Value::Arg(0), Value::Const(aux.coeff))));
            let add_id = new_func.fresh_value();
            block_instrs.push((add_id, Instruction::Add(base, Value::Instr(mul_id))));
            vmap.insert(aux.phi, Value::Instr(add_id));
        }

        for (old_id, instr) in &body_instrs {
            let remapped = remap_instruction(instr, loop_.indvar, &vmap, &loaded);
            let new_val_id = new_func.fresh_value();
            vmap.insert(*old_id, Value::Instr(new_val_id));
            block_instrs.push((new_val_id, remapped));
        }

        new_func.push_block(BasicBlock { id: entry, instructions: block_instrs, terminator: Terminator::Ret(None) });
        new_id
    }

    /// Clone the block after the loop (`Exit`) into a standalone
    /// `fn(i64, ptr) -> void`, the continuation dispatched once the
    /// extracted nested loop's job (and any successors) completes. This
    /// crate's toy loops have exactly one post-loop block, so no further
    /// live-in marshalling is needed beyond what `Exit` itself already
    /// references as function arguments.
    fn emit_continuation(&mut self, function_id: FunctionId, loop_: &CanonicalLoop, name: &str) -> FunctionId {
        let exit_instrs = self.module.function(function_id).block(loop_.exit).instructions.clone();

        let new_id = self.module.declare_function(name, vec![64, 64]);
        let new_func = self.module.function_mut(new_id);
        let entry = new_func.fresh_block();

        let mut block_instrs = Vec::new();
        let mut vmap: HashMap<ValueId, Value> = HashMap::new();
        for (old_id, instr) in &exit_instrs {
            let remapped = remap_instruction(instr, loop_.indvar, &vmap, &HashMap::new());
            let new_val_id = new_func.fresh_value();
            vmap.insert(*old_id, Value::Instr(new_val_id));
            block_instrs.push((new_val_id, remapped));
        }

        new_func.push_block(BasicBlock { id: entry, instructions: block_instrs, terminator: Terminator::Ret(None) });
        new_id
    }

    /// `createStoresForArgs`: allocate one pointer-sized scope cell per
    /// live-in and store each one's current value into it, appended to the
    /// preheader ahead of the dispatch call. Returns the scope pointer, or
    /// a null constant when there is nothing to marshal.
    /// `createStoresForArgs`. This model's [`Value`] carries no pointer/scalar
    /// distinction (see [`super`]'s module docs), so every live-in is stored
    /// into its scope slot directly and loaded back directly in
    /// [`Self::emit_extracted_body`] -- the scalar double-indirection the
    /// original takes for non-pointer live-ins collapses to the pointer case
    /// here, since there is no type tag to branch on.
    fn marshal_live_ins(&mut self, function_id: FunctionId, live_ins: &[u32], preheader: BlockId) -> Value {
        if live_ins.is_empty() {
            debug!("no live-ins, skipping scope allocation");
            return Value::Const(0);
        }

        let func = self.module.function_mut(function_id);
        let malloc_id = func.fresh_value();
        let mut new_instrs = vec![(
            malloc_id,
            Instruction::Call {
                callee: Callee::Runtime(RuntimeHook::Malloc),
                args: vec![Value::Const(8), Value::Const(live_ins.len() as i64)],
            },
        )];
        for (i, &arg) in live_ins.iter().enumerate() {
            let gep_id = func.fresh_value();
            new_instrs.push((
                gep_id,
                Instruction::Gep { base: Value::Instr(malloc_id), index: Value::Const(i as i64), elem_size: 8 },
            ));
            let store_id = func.fresh_value();
            new_instrs.push((store_id, Instruction::Store { addr: Value::Instr(gep_id), value: Value::Arg(arg), size: 8 }));
        }

        func.block_mut(preheader).instructions.extend(new_instrs);
        Value::Instr(malloc_id)
    }

    /// `enqueueTask`: replace the preheader's terminator with a call to
    /// `__enqueue_task` followed by either a conditional branch back to the
    /// (still-present) sequential header on conflict, or a plain return
    /// when this function is itself a generated body.
    fn emit_dispatch(
        &mut self,
        function_id: FunctionId,
        loop_: &CanonicalLoop,
        parallel: FunctionId,
        sequential: Option<FunctionId>,
        continuation: Option<FunctionId>,
        scope: Value,
        is_nested: bool,
    ) {
        let func = self.module.function_mut(function_id);
        let call_id = func.fresh_value();
        let args = vec![
            Value::FuncRef(parallel),
            sequential.map(Value::FuncRef).unwrap_or(Value::Const(0)),
            continuation.map(Value::FuncRef).unwrap_or(Value::Const(0)),
            scope,
            Value::Const(0),
            loop_.bounds.start,
            Value::Const(loop_.bounds.step),
            loop_.bounds.final_,
        ];
        let call = Instruction::Call { callee: Callee::Runtime(RuntimeHook::EnqueueTask), args };

        let preheader = func.block_mut(loop_.preheader);
        preheader.instructions.push((call_id, call));
        preheader.terminator = if is_nested {
            Terminator::Ret(None)
        } else {
            Terminator::CondBr { cond: Value::Instr(call_id), then_block: loop_.exit, else_block: loop_.header }
        };
    }
}

fn find_live_ins(func: &Function, loop_: &CanonicalLoop) -> Vec<u32> {
    let control = loop_.control_ids();
    let header = func.block(loop_.header);
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for (id, instr) in &header.instructions {
        if control.contains(id) {
            continue;
        }
        for operand in operands(instr) {
            if let Value::Arg(a) = operand {
                if seen.insert(a) {
                    order.push(a);
                }
            }
        }
    }
    order
}

fn remap_value(value: Value, indvar: ValueId, vmap: &HashMap<ValueId, Value>, loaded: &HashMap<u32, Value>) -> Value {
    match value {
        Value::Const(_) | Value::FuncRef(_) => value,
        Value::Arg(a) => loaded.get(&a).copied().unwrap_or(value),
        Value::Instr(id) if id == indvar => Value::Arg(0),
        Value::Instr(id) => vmap.get(&id).copied().unwrap_or(value),
    }
}

fn remap_instruction(
    instr: &Instruction,
    indvar: ValueId,
    vmap: &HashMap<ValueId, Value>,
    loaded: &HashMap<u32, Value>,
) -> Instruction {
    let r = |v: Value| remap_value(v, indvar, vmap, loaded);
    match instr {
        Instruction::Phi { .. } => unreachable!("PHI nodes are loop control, never cloned into a body"),
        Instruction::Add(a, b) => Instruction::Add(r(*a), r(*b)),
        Instruction::Sub(a, b) => Instruction::Sub(r(*a), r(*b)),
        Instruction::Mul(a, b) => Instruction::Mul(r(*a), r(*b)),
        Instruction::IcmpSlt(a, b) => Instruction::IcmpSlt(r(*a), r(*b)),
        Instruction::Gep { base, index, elem_size } => {
            Instruction::Gep { base: r(*base), index: r(*index), elem_size: *elem_size }
        }
        Instruction::Load { addr, size } => Instruction::Load { addr: r(*addr), size: *size },
        Instruction::Store { addr, value, size } => Instruction::Store { addr: r(*addr), value: r(*value), size: *size },
        Instruction::Call { callee, args } => Instruction::Call { callee: *callee, args: args.iter().copied().map(r).collect() },
    }
}
