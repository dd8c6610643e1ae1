//! Post-emission IR verification (§8: "every function in GeneratedFunctions
//! passes IR verification"), run once a body has been cloned and rewired.
//! Stands in for `llvm::verifyFunction`, scoped to the handful of structural
//! invariants this crate's passes could actually violate: a block whose
//! terminator targets a block id that doesn't exist, or an instruction whose
//! operand refers to a value id nothing in the function defines.

use super::{operands, FunctionId, Module, Terminator, Value};
use crate::error::CompileError;

/// Check every block and instruction in `function_id` against the module.
/// Fatal by construction (see [`CompileError::is_fatal`]): a freshly emitted
/// body that fails this is a bug in the emitting pass, not a malformed input
/// loop, so there is no sensible recovery other than aborting the run.
pub fn verify_function(module: &Module, function_id: FunctionId) -> Result<(), CompileError> {
    let function = module.function(function_id);

    if function.blocks.is_empty() {
        return Err(verification_failed(function.name.clone(), "function has no basic blocks".into()));
    }
    if !function.blocks.iter().any(|b| b.id == function.entry) {
        return Err(verification_failed(function.name.clone(), format!("entry block {:?} is not in the function", function.entry)));
    }

    for block in &function.blocks {
        match &block.terminator {
            Terminator::Br(target) => check_block_target(function, *target)?,
            Terminator::CondBr { cond, then_block, else_block } => {
                check_operand(function, *cond)?;
                check_block_target(function, *then_block)?;
                check_block_target(function, *else_block)?;
            }
            Terminator::Ret(value) => {
                if let Some(v) = value {
                    check_operand(function, *v)?;
                }
            }
        }

        for (_, instr) in &block.instructions {
            for operand in operands(instr) {
                check_operand(function, operand)?;
            }
        }
    }

    Ok(())
}

fn check_block_target(function: &super::Function, target: super::BlockId) -> Result<(), CompileError> {
    if function.blocks.iter().any(|b| b.id == target) {
        Ok(())
    } else {
        Err(verification_failed(function.name.clone(), format!("terminator targets unknown block {target:?}")))
    }
}

fn check_operand(function: &super::Function, value: Value) -> Result<(), CompileError> {
    if let Value::Instr(id) = value {
        if function.define_site(value).is_none() {
            return Err(verification_failed(function.name.clone(), format!("operand {id:?} has no defining instruction in the function")));
        }
    }
    Ok(())
}

fn verification_failed(function: String, reason: String) -> CompileError {
    CompileError::VerificationFailed { function, reason }
}
