//! Scalar-evolution-lite: recognizes a canonical counted loop in the toy IR
//! and derives its bounds, standing in for `ScalarEvolution`/
//! `Loop::getBounds`/`Loop::getInductionVariable`.

use crate::error::CompileError;

use super::{BlockId, Function, Instruction, Terminator, Value, ValueId};

/// `start`, a constant `step`, and `final_` -- mirrors `Loop::LoopBounds`.
#[derive(Debug, Clone, Copy)]
pub struct LoopBounds {
    pub start: Value,
    pub step: i64,
    pub final_: Value,
}

/// An auxiliary PHI in the loop header besides the induction variable,
/// expanded to a closed form `base + coeff * iteration` the way
/// `SCEVExpander` would -- see `findPHINodesForLoop`/`expandPHINodes` in the
/// original. Only affine recurrences of this exact shape are expandable;
/// anything else is `CompileError::UnexpandablePhi`.
#[derive(Debug, Clone, Copy)]
pub struct ExpandedPhi {
    pub phi: ValueId,
    pub next: ValueId,
    pub base: Value,
    pub coeff: i64,
}

/// A recognized canonical loop: a single header block that is its own
/// latch, with one induction PHI, an optional set of affine auxiliary PHIs,
/// and a comparison-gated conditional branch back to itself or out to exit.
pub struct CanonicalLoop {
    pub preheader: BlockId,
    pub header: BlockId,
    pub exit: BlockId,
    pub indvar: ValueId,
    pub indvar_next: ValueId,
    pub cmp: ValueId,
    pub bounds: LoopBounds,
    pub aux_phis: Vec<ExpandedPhi>,
}

impl CanonicalLoop {
    /// Ids of every instruction that exists purely to drive loop control
    /// (the induction PHIs, their latch increments, and the exit
    /// comparison) rather than loop body work -- these are never cloned
    /// into the extracted parallel body.
    pub fn control_ids(&self) -> std::collections::HashSet<ValueId> {
        let mut ids = std::collections::HashSet::new();
        ids.insert(self.indvar);
        ids.insert(self.indvar_next);
        ids.insert(self.cmp);
        for aux in &self.aux_phis {
            ids.insert(aux.phi);
            ids.insert(aux.next);
        }
        ids
    }
}

fn phi_incoming<'a>(
    incoming: &'a [(BlockId, Value)],
    preheader: BlockId,
    header: BlockId,
) -> Option<(Value, Value)> {
    let start = incoming.iter().find(|(b, _)| *b == preheader)?.1;
    let next = incoming.iter().find(|(b, _)| *b == header)?.1;
    Some((start, next))
}

/// `value == Add(Value::Instr(phi), Const(step))`, i.e. the classic
/// `i = i + step` latch update.
fn affine_step(func: &Function, phi: ValueId, value: Value) -> Option<i64> {
    let (_, instr) = func.define_site(value)?;
    let Instruction::Add(a, b) = instr else { return None };
    match (a, b) {
        (Value::Instr(v), Value::Const(step)) if *v == phi => Some(*step),
        (Value::Const(step), Value::Instr(v)) if *v == phi => Some(*step),
        _ => None,
    }
}

pub fn find_canonical_loop(
    func: &Function,
    function_name: &str,
    preheader: BlockId,
    header: BlockId,
) -> Result<CanonicalLoop, CompileError> {
    let non_canonical = |reason: &str| CompileError::NonCanonical {
        function: function_name.to_string(),
        reason: reason.to_string(),
    };

    let header_block = func.block(header);

    let mut phis = header_block
        .instructions
        .iter()
        .filter_map(|(id, i)| match i {
            Instruction::Phi { incoming, bits } => Some((*id, incoming, *bits)),
            _ => None,
        });

    let (indvar, indvar_incoming, bits) =
        phis.next().ok_or_else(|| non_canonical("no PHI node found in loop header"))?;

    if bits > 64 {
        return Err(CompileError::InductionTooWide { function: function_name.to_string() });
    }

    let (start, next) = phi_incoming(indvar_incoming, preheader, header)
        .ok_or_else(|| non_canonical("induction PHI lacks preheader/latch incoming edges"))?;

    let step = affine_step(func, indvar, next)
        .ok_or_else(|| CompileError::NonConstantStep { function: function_name.to_string() })?;
    if step <= 0 {
        return Err(CompileError::NonConstantStep { function: function_name.to_string() });
    }

    let Terminator::CondBr { cond, then_block, else_block } = &header_block.terminator else {
        return Err(non_canonical("loop header is not terminated by a conditional branch"));
    };

    let (header_succ, exit) = if *then_block == header {
        (*then_block, *else_block)
    } else if *else_block == header {
        (*else_block, *then_block)
    } else {
        return Err(non_canonical("loop header's conditional branch has no back edge"));
    };
    debug_assert_eq!(header_succ, header);

    let (_, cond_instr) = func
        .define_site(*cond)
        .ok_or_else(|| CompileError::MissingBounds { function: function_name.to_string() })?;
    let Instruction::IcmpSlt(lhs, rhs) = cond_instr else {
        return Err(CompileError::MissingBounds { function: function_name.to_string() });
    };
    let Value::Instr(cmp) = *cond else {
        return Err(CompileError::MissingBounds { function: function_name.to_string() });
    };
    let Value::Instr(indvar_next) = next else {
        return Err(CompileError::NonConstantStep { function: function_name.to_string() });
    };

    let final_ = if *lhs == Value::Instr(indvar) || *lhs == next {
        *rhs
    } else if *rhs == Value::Instr(indvar) || *rhs == next {
        *lhs
    } else {
        return Err(CompileError::MissingBounds { function: function_name.to_string() });
    };

    let mut aux_phis = Vec::new();
    for (id, incoming, aux_bits) in phis {
        if aux_bits > 64 {
            return Err(CompileError::InductionTooWide { function: function_name.to_string() });
        }
        let (aux_start, aux_next) = phi_incoming(incoming, preheader, header).ok_or_else(|| {
            CompileError::UnexpandablePhi {
                function: function_name.to_string(),
                phi: format!("{id:?}"),
            }
        })?;
        let coeff = affine_step(func, id, aux_next).ok_or_else(|| CompileError::UnexpandablePhi {
            function: function_name.to_string(),
            phi: format!("{id:?}"),
        })?;
        let Value::Instr(aux_next_id) = aux_next else {
            return Err(CompileError::UnexpandablePhi {
                function: function_name.to_string(),
                phi: format!("{id:?}"),
            });
        };
        aux_phis.push(ExpandedPhi { phi: id, next: aux_next_id, base: aux_start, coeff });
    }

    Ok(CanonicalLoop {
        preheader,
        header,
        exit,
        indvar,
        indvar_next,
        cmp,
        bounds: LoopBounds { start, step, final_ },
        aux_phis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicBlock, Callee, RuntimeHook};

    /// `for (i = 0; i < 10; i += 1) { *arg0 += i; }` as a two-block
    /// function: preheader branches into header, header is its own latch.
    fn build_counted_loop() -> (Function, BlockId, BlockId) {
        let mut f = Function::new(super::super::FunctionId(0), "f", vec![64]);
        let preheader = f.fresh_block();
        let header = f.fresh_block();
        let exit = f.fresh_block();

        f.push_block(BasicBlock {
            id: preheader,
            instructions: vec![],
            terminator: Terminator::Br(header),
        });

        let phi_id = f.fresh_value();
        let next_id = f.fresh_value();
        let cmp_id = f.fresh_value();
        let store_id = f.fresh_value();

        f.push_block(BasicBlock {
            id: header,
            instructions: vec![
                (
                    phi_id,
                    Instruction::Phi {
                        incoming: vec![(preheader, Value::Const(0)), (header, Value::Instr(next_id))],
                        bits: 64,
                    },
                ),
                (
                    store_id,
                    Instruction::Store { addr: Value::Arg(0), value: Value::Instr(phi_id), size: 8 },
                ),
                (next_id, Instruction::Add(Value::Instr(phi_id), Value::Const(1))),
                (cmp_id, Instruction::IcmpSlt(Value::Instr(next_id), Value::Const(10))),
            ],
            terminator: Terminator::CondBr { cond: Value::Instr(cmp_id), then_block: header, else_block: exit },
        });

        f.push_block(BasicBlock { id: exit, instructions: vec![], terminator: Terminator::Ret(None) });

        let _ = Callee::Runtime(RuntimeHook::Malloc);
        (f, preheader, header)
    }

    #[test]
    fn recognizes_simple_counted_loop() {
        let (f, preheader, header) = build_counted_loop();
        let canonical = find_canonical_loop(&f, "f", preheader, header).unwrap();
        assert_eq!(canonical.bounds.step, 1);
        assert!(matches!(canonical.bounds.start, Value::Const(0)));
        assert!(matches!(canonical.bounds.final_, Value::Const(10)));
        assert!(canonical.aux_phis.is_empty());
    }

    #[test]
    fn non_constant_step_is_rejected() {
        let mut f = Function::new(super::super::FunctionId(0), "f", vec![64]);
        let preheader = f.fresh_block();
        let header = f.fresh_block();
        let exit = f.fresh_block();
        f.push_block(BasicBlock { id: preheader, instructions: vec![], terminator: Terminator::Br(header) });

        let phi_id = f.fresh_value();
        let next_id = f.fresh_value();
        let mul_id = f.fresh_value();
        let cmp_id = f.fresh_value();
        f.push_block(BasicBlock {
            id: header,
            instructions: vec![
                (
                    phi_id,
                    Instruction::Phi {
                        incoming: vec![(preheader, Value::Const(1)), (header, Value::Instr(next_id))],
                        bits: 64,
                    },
                ),
                (mul_id, Instruction::Mul(Value::Instr(phi_id), Value::Instr(phi_id))),
                (next_id, Instruction::Add(Value::Instr(mul_id), Value::Const(0))),
                (cmp_id, Instruction::IcmpSlt(Value::Instr(next_id), Value::Const(100))),
            ],
            terminator: Terminator::CondBr { cond: Value::Instr(cmp_id), then_block: header, else_block: exit },
        });
        f.push_block(BasicBlock { id: exit, instructions: vec![], terminator: Terminator::Ret(None) });

        let err = find_canonical_loop(&f, "f", preheader, header).unwrap_err();
        assert!(matches!(err, CompileError::NonConstantStep { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn induction_wider_than_64_bits_is_fatal() {
        let mut f = Function::new(super::super::FunctionId(0), "f", vec![64]);
        let preheader = f.fresh_block();
        let header = f.fresh_block();
        f.push_block(BasicBlock { id: preheader, instructions: vec![], terminator: Terminator::Br(header) });
        let phi_id = f.fresh_value();
        f.push_block(BasicBlock {
            id: header,
            instructions: vec![(
                phi_id,
                Instruction::Phi { incoming: vec![(preheader, Value::Const(0))], bits: 128 },
            )],
            terminator: Terminator::Ret(None),
        });

        let err = find_canonical_loop(&f, "f", preheader, header).unwrap_err();
        assert!(matches!(err, CompileError::InductionTooWide { .. }));
        assert!(err.is_fatal());
    }
}
