// parallex: speculative loop-parallelization compiler pass + runtime
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
// Unsafe code is confined to `ffi` (the ABI boundary) and `pool` (the
// rollback memcpy), both documented with safety justifications.

//! # Parallex
//!
//! A speculative loop-parallelization system: a compile-time IR transformer
//! that extracts canonical outermost loop bodies into standalone functions,
//! and a runtime that schedules the extracted iterations across a worker
//! pool, detects cross-iteration read/write conflicts with vector
//! timestamps, and rolls back + falls back to sequential execution when one
//! is observed.
//!
//! ## Key components
//!
//! - **[`timestamp`]** — lexicographically-ordered vector timestamps that
//!   uniquely identify a task within its job hierarchy.
//! - **[`version_log`]** / **[`job_state`]** — the conflict-detection engine:
//!   per-address read/write history and the undo log used to roll back a
//!   failed job's writes.
//! - **[`task`]** / **[`job`]** / **[`pool`]** — the scheduler: one task per
//!   loop iteration, a priority-ordered job queue, and the fixed worker pool
//!   that drains jobs and dispatches continuations.
//! - **[`ir`]** — the compile-time side: [`ir::loop_extraction`] clones a
//!   canonical loop into a parallel body (and, for nested loops, a
//!   sequential fallback and continuation), [`ir::instrument`] inserts the
//!   conflict-check calls the runtime relies on.
//! - **[`ffi`]** — the `extern "C"` ABI (`__enqueue_task`,
//!   `__check_load_conflict`, `__check_write_conflict`, `__malloc`) that
//!   generated code calls into.
//! - **[`pipeline`]** — [`PassPipeline::run`] orders the two IR passes over
//!   a module and gates each on [`PipelineConfig`].
//!
//! ## Non-goals
//!
//! No binding to a real LLVM (or any) compiler backend — [`ir`] is a
//! self-contained model sufficient to express canonical counted loops, not
//! a wrapper over an existing IR. No attempt to preserve exact IEEE or
//! side-effect semantics across a rollback, and no progress guarantee when
//! the sequential fallback itself conflicts at an outer nesting level.
//!
//! ## Example
//!
//! ```
//! use parallex::ffi::{__check_write_conflict, __enqueue_task, __malloc};
//! use std::sync::atomic::{AtomicI64, Ordering};
//!
//! static OUT: [AtomicI64; 4] =
//!     [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)];
//!
//! fn body(i: i64, scope: parallex::task::RawScope) {
//!     unsafe {
//!         let out_base = *(scope.as_addr() as *const *mut u8) as *mut i64;
//!         let addr = out_base.add(i as usize) as *mut u8;
//!         __check_write_conflict(addr, 8);
//!         *(addr as *mut i64) = i;
//!     }
//! }
//!
//! unsafe {
//!     let scope = __malloc(8, 1);
//!     *(scope as *mut *mut u8) = OUT.as_ptr() as *mut u8;
//!     let no_conflict = __enqueue_task(body, None, None, scope, std::ptr::null_mut(), 0, 1, 4);
//!     assert!(no_conflict);
//! }
//! assert_eq!(OUT[3].load(Ordering::Relaxed), 3);
//! ```

pub mod config;
pub mod error;
pub mod ffi;
pub mod ir;
pub mod job;
pub mod job_state;
pub mod pipeline;
pub mod pool;
pub mod task;
pub mod timestamp;
pub mod version_log;

pub use config::{InstrumentationConfig, PipelineConfig, PoolConfig};
pub use error::{CompileError, RuntimeError};
pub use job::{BodyFn, Job, JobId};
pub use job_state::JobState;
pub use pipeline::PassPipeline;
pub use pool::ThreadPool;
pub use task::{RawScope, Task, TaskId};
pub use timestamp::Timestamp;
pub use version_log::VersionLog;

/// Install a default `tracing` subscriber if one is not already set, so
/// library consumers that don't configure their own get readable pass/run
/// diagnostics instead of silently dropped events. Idempotent; safe to call
/// more than once (subsequent calls are no-ops, matching
/// `tracing::subscriber::set_global_default`'s documented behavior via
/// `try_init`).
pub fn init_tracing() {
    let _ = tracing_subscriber_fallback();
}

#[cfg(not(test))]
fn tracing_subscriber_fallback() -> Result<(), ()> {
    // No `tracing-subscriber` dependency outside of tests/benches (it is a
    // dev-dependency); library consumers wire up their own subscriber. This
    // is a deliberate no-op in non-test builds.
    Ok(())
}

#[cfg(test)]
fn tracing_subscriber_fallback() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::fmt::try_init()
}
