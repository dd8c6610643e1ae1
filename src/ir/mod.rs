//! A small in-crate IR model standing in for `llvm::Module`/`llvm::Function`.
//!
//! This crate has no LLVM binding (see the Non-goal on that in the crate
//! root docs), so [`loop_extraction`] and [`instrument`] operate over this
//! SSA-ish model instead: indexed basic blocks, a distinct [`Terminator`]
//! from ordinary [`Instruction`]s, and values that are either a function
//! argument, a prior instruction's result, or a constant. It is just
//! expressive enough to represent a canonical counted loop, marshal its
//! live-ins into a heap cell, and emit the runtime dispatch call the way
//! the original LLVM pass does.

pub mod instrument;
pub mod loop_extraction;
pub mod scev;
pub mod verify;

use std::collections::HashSet;

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

/// Identifies a [`Function`] within a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Identifies a [`BasicBlock`] within a [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Identifies an instruction's result within a [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// An operand: one of the function's own parameters, a previously defined
/// instruction's result, or a compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Arg(u32),
    Instr(ValueId),
    Const(i64),
    /// A function's address, used only as a dispatch-call argument (the
    /// ABI table's `ParallelBody`/`SequentialBody`/`Continuation`
    /// parameters) -- never produced by an ordinary instruction.
    FuncRef(FunctionId),
}

/// The runtime ABI hooks a generated body calls into (§6). Modeled as a
/// distinct callee kind rather than an ordinary [`FunctionId`] since these
/// never exist as IR functions in the module -- they are external, exactly
/// as the original declares them via `M->getFunction("__enqueue_task")`
/// with a synthesized declaration the first time they're referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHook {
    EnqueueTask,
    CheckLoadConflict,
    CheckWriteConflict,
    Malloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Function(FunctionId),
    Runtime(RuntimeHook),
}

/// One operation. `size` fields on `Load`/`Store` are byte counts, used by
/// the instrumentation pass to size the `CheckLoad`/`CheckStore` pseudo-call
/// it inserts and, at runtime, by `JobState`'s undo snapshot.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// `phi [start, incoming_block], ...`. `bits` is the induction
    /// variable's integer width -- widths over 64 make the loop
    /// unextractable (§4.1 fatal case).
    Phi { incoming: Vec<(BlockId, Value)>, bits: u32 },
    Add(Value, Value),
    Sub(Value, Value),
    Mul(Value, Value),
    IcmpSlt(Value, Value),
    /// A pointer offset by `index * elem_size` bytes from `base` -- stands
    /// in for `getelementptr`.
    Gep { base: Value, index: Value, elem_size: usize },
    Load { addr: Value, size: usize },
    Store { addr: Value, value: Value, size: usize },
    Call { callee: Callee, args: Vec<Value> },
}

#[derive(Debug, Clone)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Option<Value>),
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub instructions: Vec<(ValueId, Instruction)>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn find(&self, id: ValueId) -> Option<&Instruction> {
        self.instructions.iter().find(|(v, _)| *v == id).map(|(_, i)| i)
    }
}

/// A loop header/preheader pair a function declares up front, standing in
/// for LLVM's `LoopInfo` analysis -- this crate does not implement general
/// loop discovery over arbitrary control flow, only consumes an
/// already-identified set of natural loops, matching the scope of "operates
/// over the in-crate IR model" (SPEC_FULL §1).
#[derive(Debug, Clone, Copy)]
pub struct DeclaredLoop {
    pub preheader: BlockId,
    pub header: BlockId,
}

/// A function in the module: a flat list of parameter bit-widths (this toy
/// model only has integers and opaque pointers, so a param is either `64`
/// for an `i64`/pointer or some narrower width) and basic blocks.
#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub param_bits: Vec<u32>,
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
    pub loops: Vec<DeclaredLoop>,
    next_value: u32,
    next_block: u32,
}

impl Function {
    pub fn new(id: FunctionId, name: impl Into<String>, param_bits: Vec<u32>) -> Self {
        Function {
            id,
            name: name.into(),
            param_bits,
            blocks: Vec::new(),
            entry: BlockId(0),
            loops: Vec::new(),
            next_value: 0,
            next_block: 0,
        }
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    /// The next value id that would be handed out by [`Function::fresh_value`].
    /// Used by [`instrument`] to mint `CheckLoad`/`CheckStore` pseudo-call
    /// ids without going through a `&mut Function` borrow while iterating a
    /// cloned snapshot of the old blocks.
    pub fn value_counter(&self) -> u32 {
        self.next_value
    }

    /// Restore the value-id counter after minting ids out-of-band (see
    /// [`Function::value_counter`]).
    pub fn set_value_counter(&mut self, counter: u32) {
        self.next_value = counter;
    }

    pub fn fresh_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    pub fn push_block(&mut self, block: BasicBlock) {
        if self.blocks.is_empty() {
            self.entry = block.id;
        }
        self.blocks.push(block);
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        self.blocks.iter().find(|b| b.id == id).expect("unknown block id")
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.blocks.iter_mut().find(|b| b.id == id).expect("unknown block id")
    }

    /// Find the instruction defining `value`, if it is one.
    pub fn define_site(&self, value: Value) -> Option<(BlockId, &Instruction)> {
        let Value::Instr(id) = value else { return None };
        self.blocks.iter().find_map(|b| b.find(id).map(|i| (b.id, i)))
    }
}

/// Almost every instruction has 0-2 operands; `Call` is the only variant
/// that can spill past the inline capacity, and does so rarely (marshalled
/// live-ins are the only multi-arg calls this crate emits).
pub(crate) fn operands(instr: &Instruction) -> SmallVec<[Value; 2]> {
    match instr {
        Instruction::Phi { .. } => SmallVec::new(),
        Instruction::Add(a, b) | Instruction::Sub(a, b) | Instruction::Mul(a, b) | Instruction::IcmpSlt(a, b) => {
            smallvec![*a, *b]
        }
        Instruction::Gep { base, index, .. } => smallvec![*base, *index],
        Instruction::Load { addr, .. } => smallvec![*addr],
        Instruction::Store { addr, value, .. } => smallvec![*addr, *value],
        Instruction::Call { args, .. } => SmallVec::from_vec(args.clone()),
    }
}

/// The module: a registry of functions plus the two process-wide sets the
/// original pass keeps as static `std::set<Function *>` members
/// (`GeneratedFunctions`, `PreservedFunctions`) and the clone registry the
/// instrumentation pass uses to avoid re-cloning an already-instrumented
/// callee.
pub struct Module {
    functions: FxHashMap<FunctionId, Function>,
    next_function: u32,
    generated: HashSet<FunctionId>,
    preserved: HashSet<FunctionId>,
    clone_registry: FxHashMap<FunctionId, FunctionId>,
}

impl Module {
    pub fn new() -> Self {
        Module {
            functions: FxHashMap::default(),
            next_function: 0,
            generated: HashSet::new(),
            preserved: HashSet::new(),
            clone_registry: FxHashMap::default(),
        }
    }

    pub fn declare_function(&mut self, name: impl Into<String>, param_bits: Vec<u32>) -> FunctionId {
        let id = FunctionId(self.next_function);
        self.next_function += 1;
        self.functions.insert(id, Function::new(id, name, param_bits));
        id
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[&id]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        self.functions.get_mut(&id).expect("unknown function id")
    }

    pub fn mark_generated(&mut self, id: FunctionId) {
        self.generated.insert(id);
    }

    pub fn is_generated(&self, id: FunctionId) -> bool {
        self.generated.contains(&id)
    }

    pub fn mark_preserved(&mut self, id: FunctionId) {
        self.preserved.insert(id);
    }

    pub fn is_preserved(&self, id: FunctionId) -> bool {
        self.preserved.contains(&id)
    }

    pub fn generated_functions(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.generated.iter().copied()
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.functions.keys().copied()
    }

    /// Record that `original`'s transitive callee `callee` was cloned to
    /// `clone` during instrumentation, so a later visit reuses the clone
    /// instead of cloning again.
    pub fn record_clone(&mut self, callee: FunctionId, clone: FunctionId) {
        self.clone_registry.insert(callee, clone);
    }

    pub fn cloned_callee(&self, callee: FunctionId) -> Option<FunctionId> {
        self.clone_registry.get(&callee).copied()
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
