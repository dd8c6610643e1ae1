//! The instrumentation pass (§4.2): walks every generated function,
//! inserting `CheckLoad`/`CheckStore` pseudo-calls before loads/stores
//! (skipping the three documented exceptions), and transitively clones and
//! instruments any callee a generated function reaches that isn't already
//! generated. Mirrors `InstrumentFunctionPass` in the original plugin.

use std::collections::HashSet;

use tracing::{debug, instrument};

use super::{BasicBlock, Callee, FunctionId, Instruction, Module, RuntimeHook, Value, ValueId};

pub struct InstrumentFunctionPass<'m> {
    module: &'m mut Module,
}

impl<'m> InstrumentFunctionPass<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        InstrumentFunctionPass { module }
    }

    /// Instrument every currently-generated function, then drain the
    /// worklist of transitively-discovered callees the way the original's
    /// `InstrumentStack` does.
    #[instrument(skip(self))]
    pub fn run(&mut self) {
        let mut stack: Vec<FunctionId> = self.module.generated_functions().collect();
        let mut instrumented: HashSet<FunctionId> = HashSet::new();

        while let Some(f) = stack.pop() {
            if instrumented.contains(&f) {
                continue;
            }
            self.instrument_function(f, &mut stack);
            instrumented.insert(f);
        }
    }

    fn instrument_function(&mut self, function_id: FunctionId, stack: &mut Vec<FunctionId>) {
        debug!(function = function_id.0, "instrumenting");
        self.add_versioning_and_conflict_detection(function_id);
        self.collect_called_functions(function_id, stack);
    }

    /// Clone any callee not already generated/instrumented, rewrite this
    /// function's call sites to point at the clone, and push it onto the
    /// worklist -- `collectCalledFunctions`.
    fn collect_called_functions(&mut self, function_id: FunctionId, stack: &mut Vec<FunctionId>) {
        let calls: Vec<FunctionId> = self
            .module
            .function(function_id)
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter_map(|(_, i)| match i {
                Instruction::Call { callee: Callee::Function(callee), .. } => Some(*callee),
                _ => None,
            })
            .collect();

        for callee in calls {
            if self.module.is_generated(callee) {
                continue;
            }
            let clone_id = match self.module.cloned_callee(callee) {
                Some(existing) => existing,
                None => {
                    let clone_id = self.clone_function(callee);
                    self.module.record_clone(callee, clone_id);
                    stack.push(clone_id);
                    clone_id
                }
            };
            self.rewrite_calls_to(function_id, callee, clone_id);
        }
    }

    fn clone_function(&mut self, callee: FunctionId) -> FunctionId {
        let original = self.module.function(callee).clone();
        let new_id = self.module.declare_function(format!("{}.clone", original.name), original.param_bits.clone());
        let new_func = self.module.function_mut(new_id);
        new_func.blocks = original.blocks;
        new_func.entry = original.entry;
        new_func.set_value_counter(original.value_counter());
        new_id
    }

    fn rewrite_calls_to(&mut self, function_id: FunctionId, old: FunctionId, new: FunctionId) {
        let func = self.module.function_mut(function_id);
        for block in &mut func.blocks {
            for (_, instr) in &mut block.instructions {
                if let Instruction::Call { callee: Callee::Function(id), .. } = instr {
                    if *id == old {
                        *id = new;
                    }
                }
            }
        }
    }

    /// `addVersioningAndConflictDetection`: insert a `CheckStore` before
    /// every store and a `CheckLoad` before every load, except: (1) a store
    /// through a pointer that is itself the direct result of `__malloc`
    /// within a generated body (writing into a private scope cell, never
    /// shared); (2) a load of the scope pointer argument itself; (3) a load
    /// through one level of dereference of the scope pointer (a `Load` or
    /// `Gep` whose own pointer operand is the scope argument).
    fn add_versioning_and_conflict_detection(&mut self, function_id: FunctionId) {
        let is_generated = self.module.is_generated(function_id);
        let func = self.module.function_mut(function_id);
        let scope_ptr = Value::Arg(1);
        let mut counter = func.value_counter();
        let old_blocks = func.blocks.clone();

        let mut new_blocks = Vec::with_capacity(old_blocks.len());
        for block in &old_blocks {
            let mut new_instrs = Vec::with_capacity(block.instructions.len());
            for (id, instr) in &block.instructions {
                let skip = match instr {
                    Instruction::Store { addr, .. } => {
                        is_generated && func.param_bits.len() >= 2 && is_malloc_result(&old_blocks, *addr)
                    }
                    Instruction::Load { addr, .. } => {
                        is_generated
                            && func.param_bits.len() >= 2
                            && (*addr == scope_ptr || derefs_directly(&old_blocks, *addr, scope_ptr))
                    }
                    _ => false,
                };

                match instr {
                    Instruction::Store { addr, size, .. } if !skip => {
                        let check_id = ValueId(counter);
                        counter += 1;
                        new_instrs.push((
                            check_id,
                            Instruction::Call {
                                callee: Callee::Runtime(RuntimeHook::CheckWriteConflict),
                                args: vec![*addr, Value::Const(*size as i64)],
                            },
                        ));
                    }
                    Instruction::Load { addr, .. } if !skip => {
                        let check_id = ValueId(counter);
                        counter += 1;
                        new_instrs.push((
                            check_id,
                            Instruction::Call {
                                callee: Callee::Runtime(RuntimeHook::CheckLoadConflict),
                                args: vec![*addr],
                            },
                        ));
                    }
                    _ => {}
                }

                new_instrs.push((*id, instr.clone()));
            }
            new_blocks.push(BasicBlock { id: block.id, instructions: new_instrs, terminator: block.terminator.clone() });
        }

        func.blocks = new_blocks;
        func.set_value_counter(counter);
    }
}

fn is_malloc_result(blocks: &[BasicBlock], addr: Value) -> bool {
    let Value::Instr(id) = addr else { return false };
    blocks.iter().find_map(|b| b.find(id)).is_some_and(|i| {
        matches!(i, Instruction::Call { callee: Callee::Runtime(RuntimeHook::Malloc), .. })
    })
}

fn derefs_directly(blocks: &[BasicBlock], addr: Value, scope_ptr: Value) -> bool {
    let Value::Instr(id) = addr else { return false };
    match blocks.iter().find_map(|b| b.find(id)) {
        Some(Instruction::Load { addr, .. }) => *addr == scope_ptr,
        Some(Instruction::Gep { base, .. }) => *base == scope_ptr,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicBlock as Block, BlockId, Function, Terminator};

    fn generated_body_with_scope_deref() -> Module {
        let mut module = Module::new();
        let id = module.declare_function("loopBody", vec![64, 64]);
        module.mark_generated(id);
        let f = module.function_mut(id);
        let entry = f.fresh_block();

        let gep = f.fresh_value();
        let direct_load = f.fresh_value();
        let shared_gep = f.fresh_value();
        let shared_load = f.fresh_value();
        let shared_store = f.fresh_value();

        f.push_block(Block {
            id: entry,
            instructions: vec![
                (gep, Instruction::Gep { base: Value::Arg(1), index: Value::Const(0), elem_size: 8 }),
                (direct_load, Instruction::Load { addr: Value::Instr(gep), size: 8 }),
                (shared_gep, Instruction::Gep { base: Value::Instr(direct_load), index: Value::Const(0), elem_size: 8 }),
                (shared_load, Instruction::Load { addr: Value::Instr(shared_gep), size: 8 }),
                (shared_store, Instruction::Store { addr: Value::Instr(shared_gep), value: Value::Arg(0), size: 8 }),
            ],
            terminator: Terminator::Ret(None),
        });
        module
    }

    #[test]
    fn skips_direct_scope_dereference_but_instruments_shared_access() {
        let mut module = generated_body_with_scope_deref();
        let id = FunctionId(0);
        let mut pass = InstrumentFunctionPass::new(&mut module);
        pass.run();

        let calls: Vec<&Instruction> = module
            .function(id)
            .block(module.function(id).entry)
            .instructions
            .iter()
            .map(|(_, i)| i)
            .filter(|i| matches!(i, Instruction::Call { callee: Callee::Runtime(_), .. }))
            .collect();

        // The direct scope-array load (`gep` off arg1) must not be
        // instrumented, but the shared load/store through its result must.
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().any(|c| matches!(c, Instruction::Call { callee: Callee::Runtime(RuntimeHook::CheckLoadConflict), .. })));
        assert!(calls.iter().any(|c| matches!(c, Instruction::Call { callee: Callee::Runtime(RuntimeHook::CheckWriteConflict), .. })));
    }

    #[test]
    fn clones_and_instruments_transitive_callee() {
        let mut module = Module::new();
        let callee_id = module.declare_function("helper", vec![64]);
        {
            let helper = module.function_mut(callee_id);
            let entry = helper.fresh_block();
            let load_id = helper.fresh_value();
            helper.push_block(Block {
                id: entry,
                instructions: vec![(load_id, Instruction::Load { addr: Value::Arg(0), size: 8 })],
                terminator: Terminator::Ret(None),
            });
        }

        let caller_id = module.declare_function("body", vec![64, 64]);
        module.mark_generated(caller_id);
        {
            let caller = module.function_mut(caller_id);
            let entry = caller.fresh_block();
            let call_id = caller.fresh_value();
            caller.push_block(Block {
                id: entry,
                instructions: vec![(call_id, Instruction::Call { callee: Callee::Function(callee_id), args: vec![Value::Arg(1)] })],
                terminator: Terminator::Ret(None),
            });
        }

        let mut pass = InstrumentFunctionPass::new(&mut module);
        pass.run();

        let clone_id = module.cloned_callee(callee_id).expect("callee should have been cloned");
        assert_ne!(clone_id, callee_id);

        // The caller's call site now targets the clone.
        let caller = module.function(caller_id);
        let retargeted = caller.blocks[0].instructions.iter().any(|(_, i)| {
            matches!(i, Instruction::Call { callee: Callee::Function(id), .. } if *id == clone_id)
        });
        assert!(retargeted);

        // The clone itself was instrumented (its load got a CheckLoad).
        let clone = module.function(clone_id);
        let has_check = clone.blocks[0]
            .instructions
            .iter()
            .any(|(_, i)| matches!(i, Instruction::Call { callee: Callee::Runtime(RuntimeHook::CheckLoadConflict), .. }));
        assert!(has_check);

        // The original, un-cloned `helper` was left untouched.
        let original = module.function(callee_id);
        assert!(!original.blocks[0].instructions.iter().any(|(_, i)| matches!(i, Instruction::Call { callee: Callee::Runtime(_), .. })));
    }
}
