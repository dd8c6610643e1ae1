//! Scaffolding shared by the scenario tests: stands in for the scope
//! marshalling (`marshal_live_ins`, §4.1 step 5) and dispatch a generated
//! preheader would otherwise emit, so each scenario can drive
//! [`parallex::ffi`] directly the way the original `threadlib/tests/*.c`
//! programs exercise the real runtime.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};

use parallex::ffi::__malloc;
use parallex::task::RawScope;

/// The `__enqueue_task`/`__check_*`/`__malloc` ABI surface all routes through
/// one process-wide singleton pool (`parallex::ffi`'s `OnceLock`), and the
/// default test harness runs every `#[test]` in this binary on its own OS
/// thread concurrently. Two scenario tests racing the same singleton would
/// corrupt each other's job/task bookkeeping, so every scenario test takes
/// this lock for its whole body before touching the FFI surface, serializing
/// access the way the original `threadlib/tests/*.c` programs -- each its
/// own process -- never had to.
static FFI_SERIAL: Mutex<()> = Mutex::new(());

pub fn ffi_guard() -> MutexGuard<'static, ()> {
    FFI_SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Leak a zeroed `i64` array of `len` elements and return its base pointer,
/// standing in for one of the original programs' `volatile int` arrays.
pub fn leak_i64_array(len: usize) -> *mut i64 {
    let storage: Vec<i64> = vec![0; len];
    Box::leak(storage.into_boxed_slice()).as_mut_ptr()
}

/// Build a scope array of pointer-sized cells, one per live-in, laid out the
/// way `marshal_live_ins` lays one out: a `__malloc`'d array of 8-byte cells,
/// each holding the live-in's raw bit pattern (an address for a pointer
/// live-in, the value itself for a scalar one -- this crate's `Value` has no
/// pointer/scalar distinction, see `DESIGN.md`).
pub fn scope_of(live_ins: &[usize]) -> RawScope {
    unsafe {
        let cell = __malloc(8, live_ins.len() as i64) as *mut usize;
        for (i, &v) in live_ins.iter().enumerate() {
            *cell.add(i) = v;
        }
        RawScope(cell as usize)
    }
}

/// Read live-in `index` back out of a scope built by [`scope_of`], the way
/// an extracted body's unmarshalling prologue does.
pub unsafe fn live_in(scope: RawScope, index: usize) -> usize {
    let cell = scope.as_addr() as *const usize;
    *cell.add(index)
}

pub fn no_scope() -> RawScope {
    RawScope::null()
}
