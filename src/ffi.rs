//! The compiler-to-runtime ABI (§6): the four `extern "C"` symbols generated
//! code calls into. `__enqueue_task` lazily constructs the process-wide
//! [`ThreadPool`] singleton on first call; the three check/alloc hooks reach
//! the same singleton, since in practice a loop's marshalling (`__malloc`)
//! and its dispatch (`__enqueue_task`) are emitted into the same function and
//! always run in that order for a given invocation.
//!
//! This crate is never actually linked against compiler-generated machine
//! code, so these entry points are exercised directly by tests: build a
//! `RawScope` over a heap-backed arena and call `__enqueue_task` the way a
//! generated preheader would, or call `__check_load_conflict`/
//! `__check_write_conflict` around a manual load/store the way an
//! instrumented body would.

use std::slice;
use std::sync::{Arc, OnceLock};

use crate::config::PoolConfig;
use crate::error::RuntimeError;
use crate::job::BodyFn;
use crate::pool::ThreadPool;
use crate::task::RawScope;

static POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();

fn pool() -> &'static Arc<ThreadPool> {
    POOL.get_or_init(|| Arc::new(ThreadPool::new(PoolConfig::default())))
}

/// Enqueue `ceil((final_ - start) / step)` tasks against the job for
/// `parallel`, blocking the calling thread until every descendant job
/// completes *iff* it is the main thread (no task currently running on it).
/// Returns `true` iff no conflict was ever observed across the whole run.
///
/// # Safety
/// `scope_in` must be null (no live-ins) or a pointer previously returned by
/// [`__malloc`] and still live; `new_scope` must be null or likewise. The
/// function pointers are trusted to have the `fn(i64, RawScope)` calling
/// convention §4.1 emits; `step` must be a positive constant (the transformer
/// never emits a call with a non-constant or non-positive step, per §4.1's
/// "fail the whole loop if step is not a `ConstantInt`").
#[no_mangle]
pub unsafe extern "C" fn __enqueue_task(
    parallel: BodyFn,
    sequential: Option<BodyFn>,
    continuation: Option<BodyFn>,
    scope_in: *mut u8,
    new_scope: *mut u8,
    start: i64,
    step: i64,
    final_: i64,
) -> bool {
    pool().enqueue_task(
        parallel,
        sequential,
        continuation,
        RawScope(scope_in as usize),
        RawScope(new_scope as usize),
        start,
        step,
        final_,
    )
}

/// Must be called immediately before each load in an instrumented function.
/// Checks the load against the version log, then records it so a later task
/// that writes this address can detect the write-after-read race (§4.3:
/// `doesLoadConflict` followed by `addRead`).
///
/// # Safety
/// Must be called from a thread currently executing a [`crate::task::Task`]
/// dispatched by [`__enqueue_task`] -- i.e. from inside a generated body.
#[no_mangle]
pub unsafe extern "C" fn __check_load_conflict(addr: *const u8) {
    let task = pool()
        .current_task()
        .unwrap_or_else(|| panic!("{}", RuntimeError::NoCurrentTask));
    let job = pool().job(task.job_id());
    job.state.check_load(addr as usize, task.timestamp());
    job.state.record_read(addr as usize, task.timestamp().clone());
}

/// Must be called immediately before each store in an instrumented function;
/// `size` is the byte width of the value about to be stored. Snapshots the
/// `size` bytes currently at `addr` into the owning Job's undo log on the
/// first write to `addr`, so the read must happen here, before the caller's
/// store executes.
///
/// # Safety
/// Same preconditions as [`__check_load_conflict`]; additionally, `addr`
/// must be valid for `size` bytes of reads right now (the caller's store has
/// not executed yet).
#[no_mangle]
pub unsafe extern "C" fn __check_write_conflict(addr: *mut u8, size: i64) {
    let task = pool()
        .current_task()
        .unwrap_or_else(|| panic!("{}", RuntimeError::NoCurrentTask));
    let job = pool().job(task.job_id());
    let size = size as usize;
    let current_bytes = slice::from_raw_parts(addr, size);
    job.state.check_and_record_write(addr as usize, task.timestamp().clone(), size, current_bytes);
}

/// Allocate `size * count` zeroed bytes, tracked for release at pool
/// teardown. Used both for the scope array itself and for the individual
/// heap cells §4.1 step 5 allocates for scalar live-ins.
///
/// # Safety
/// None beyond the usual `extern "C"` call-convention requirements; the
/// returned pointer is valid for `size * count` bytes until the pool is
/// cleared (i.e. until the outermost `__enqueue_task` call on the main
/// thread returns).
#[no_mangle]
pub unsafe extern "C" fn __malloc(size: i64, count: i64) -> *mut u8 {
    let total = (size as usize).saturating_mul(count as usize);
    let bytes: Box<[u8]> = vec![0u8; total].into_boxed_slice();
    pool().track_allocation(bytes).as_addr() as *mut u8
}
