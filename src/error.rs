//! Error taxonomy for the compile-time pass pipeline and the runtime ABI.

use thiserror::Error;

/// Failures from [`crate::ir::loop_extraction::LoopExtractionPass`] and
/// [`crate::ir::instrument::InstrumentFunctionPass`].
///
/// Per §7 of the specification, per-loop transform failures are recoverable
/// (skip the loop, leave the function untouched) while structural
/// assertions are fatal (abort the whole pipeline run, naming the offending
/// function).
#[derive(Debug, Error)]
pub enum CompileError {
    /// A loop is not in canonical form (not simplified, multiple exits, no
    /// discoverable induction variable). Recoverable: skip this loop.
    #[error("loop in `{function}` is not canonical: {reason}")]
    NonCanonical { function: String, reason: String },

    /// Scalar evolution could not produce constant bounds for the loop.
    /// Recoverable: skip this loop.
    #[error("loop in `{function}` has no computable bounds")]
    MissingBounds { function: String },

    /// The induction variable's step is not a compile-time constant.
    /// Recoverable: skip this loop.
    #[error("loop in `{function}` has a non-constant step")]
    NonConstantStep { function: String },

    /// A PHI node other than the induction variable could not be expanded
    /// to a closed form of the outer induction variable. Recoverable: skip
    /// this loop.
    #[error("PHI node `{phi}` in `{function}` is not expressible in closed form")]
    UnexpandablePhi { function: String, phi: String },

    /// The induction variable's type is wider than 64 bits. Fatal: abort
    /// the pipeline run.
    #[error("induction variable in `{function}` is wider than 64 bits")]
    InductionTooWide { function: String },

    /// IR verification failed on a freshly emitted body. Fatal.
    #[error("generated function `{function}` failed IR verification: {reason}")]
    VerificationFailed { function: String, reason: String },
}

impl CompileError {
    /// Whether this failure should abort the whole pipeline run (`true`) or
    /// merely cause the current loop to be skipped (`false`).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CompileError::InductionTooWide { .. } | CompileError::VerificationFailed { .. }
        )
    }
}

/// Violations of the runtime ABI contract (§7: "Unrecoverable runtime
/// states"). These indicate the instrumentation contract itself was
/// violated -- e.g. a `__check_*` callback fired with no pool constructed
/// yet, or outside of any task's execution -- and are not recoverable. The
/// original's C `assert()` has the same crash-the-process contract; this is
/// surfaced the same way via `panic!` at the FFI boundary rather than as a
/// `Result`, since the extern "C" ABI functions have no error channel.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime pool accessed before initialization")]
    PoolNotInitialized,

    #[error("no current task for this thread")]
    NoCurrentTask,

    #[error("no active job for this thread")]
    NoActiveJob,
}
