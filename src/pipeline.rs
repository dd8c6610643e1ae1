//! The compile-time pass pipeline (§6): `PassPipeline::run` is the entry
//! point a pass-plugin registration callback would invoke, ordering
//! [`LoopExtractionPass`] ahead of [`InstrumentFunctionPass`] -- a loop must
//! be extracted into its own function before there is anything generated to
//! instrument -- and gating each on [`PipelineConfig`]'s flags the way the
//! original pass plugin's `enable-extract-loop-bodies` command-line switch
//! gates `LoopExtractionPass::run`.

use std::collections::HashSet;

use tracing::{debug, instrument};

use crate::config::PipelineConfig;
use crate::error::CompileError;
use crate::ir::instrument::InstrumentFunctionPass;
use crate::ir::loop_extraction::LoopExtractionPass;
use crate::ir::{FunctionId, Module};

/// The module-level pass ordering. Stateless -- all state lives on
/// [`Module`] -- so `run` is an associated function rather than requiring an
/// instance.
pub struct PassPipeline;

impl PassPipeline {
    /// Run the pipeline over `module` per `config`. Per §7, a recoverable
    /// per-loop failure does not stop the pipeline from visiting the rest of
    /// the module; the first fatal [`CompileError`] aborts the run.
    #[instrument(skip(module))]
    pub fn run(module: &mut Module, config: PipelineConfig) -> Result<(), CompileError> {
        if config.enable_extract_loop_bodies {
            Self::extract_loop_bodies(module)?;
        } else {
            debug!("loop extraction disabled by PipelineConfig");
        }

        if config.instrumentation.enabled {
            InstrumentFunctionPass::new(module).run();
        } else {
            debug!("instrumentation disabled by PipelineConfig");
        }

        Ok(())
    }

    /// Extract loops out of every function currently in the module, then
    /// recurse into whatever functions that extraction just generated, per
    /// §4.1 step 4's re-entry into a nested loop's own body. Terminates once
    /// a full pass over the worklist produces no unvisited function.
    fn extract_loop_bodies(module: &mut Module) -> Result<(), CompileError> {
        let mut worklist: Vec<FunctionId> = module.function_ids().collect();
        let mut visited = HashSet::new();

        while let Some(function_id) = worklist.pop() {
            if !visited.insert(function_id) {
                continue;
            }
            debug!(function = function_id.0, "running loop extraction");
            let jobs = LoopExtractionPass::new(module).run(function_id)?;
            for job in jobs {
                worklist.push(job.parallel);
                if let Some(seq) = job.sequential {
                    worklist.push(seq);
                }
                if let Some(cont) = job.continuation {
                    worklist.push(cont);
                }
            }
        }
        Ok(())
    }
}
