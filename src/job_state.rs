//! Conflict engine: composes a [`VersionLog`] with an undo buffer and a
//! sticky conflict flag.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::version_log::{Addr, VersionLog};
use crate::timestamp::Timestamp;

/// Saved bytes for one address, installed on the first write to that address
/// within a job.
struct UndoEntry {
    size: usize,
    saved_bytes: Box<[u8]>,
}

/// Per-job conflict detector and undo log.
///
/// All mutating operations are guarded by a single mutex covering both the
/// version log and the undo map, matching the original design's single
/// `JobState` mutex. Once `no_conflicts` latches to `false` it never
/// becomes `true` again: no further undo entries are installed and no
/// further writes are appended to the version log.
pub struct JobState {
    no_conflicts: AtomicBool,
    inner: Mutex<Inner>,
}

struct Inner {
    log: VersionLog,
    undo: FxHashMap<Addr, UndoEntry>,
}

impl JobState {
    pub fn new() -> Self {
        Self {
            no_conflicts: AtomicBool::new(true),
            inner: Mutex::new(Inner {
                log: VersionLog::new(),
                undo: FxHashMap::default(),
            }),
        }
    }

    pub fn no_conflicts(&self) -> bool {
        self.no_conflicts.load(Ordering::Acquire)
    }

    fn latch_conflict(&self) {
        self.no_conflicts.store(false, Ordering::Release);
    }

    /// Record a read of `addr` at `timestamp`.
    pub fn record_read(&self, addr: Addr, timestamp: Timestamp) {
        let mut inner = self.inner.lock();
        inner.log.record_read(addr, timestamp);
    }

    /// Check whether a load of `addr` by `timestamp` races a later write.
    /// Called before the load executes.
    pub fn check_load(&self, addr: Addr, timestamp: &Timestamp) {
        let inner = self.inner.lock();
        if inner.log.has_write_after(addr, timestamp) {
            drop(inner);
            warn!(addr, %timestamp, "load conflict: later write observed");
            self.latch_conflict();
        }
    }

    /// Check whether a store of `addr` by `timestamp` races a later read or
    /// write, then record the write and (on first write to `addr`) snapshot
    /// its current contents for rollback.
    ///
    /// `current_bytes` must be a view of the `size` bytes at `addr` *before*
    /// this store is performed by the caller -- callers must instrument
    /// writes before performing them, exactly as the original contract
    /// requires.
    pub fn check_and_record_write(
        &self,
        addr: Addr,
        timestamp: Timestamp,
        size: usize,
        current_bytes: &[u8],
    ) {
        debug_assert_eq!(current_bytes.len(), size);

        let needs_snapshot = {
            let mut inner = self.inner.lock();

            if inner.log.has_read_or_write_after(addr, &timestamp) {
                drop(inner);
                warn!(addr, %timestamp, "store conflict: later read or write observed");
                self.latch_conflict();
                return;
            }

            if !self.no_conflicts() {
                return;
            }

            let first_write = !inner.log.has_write(addr);
            inner.log.record_write(addr, timestamp);

            first_write && !inner.undo.contains_key(&addr)
        };

        if needs_snapshot {
            let mut inner = self.inner.lock();
            inner.undo.entry(addr).or_insert_with(|| UndoEntry {
                size,
                saved_bytes: current_bytes.into(),
            });
        }
    }

    /// Restore every address in the undo log to the bytes it held at the
    /// moment of its first write by this job.
    ///
    /// Returns the `(addr, size)` pairs that must be memcpy'd back by the
    /// caller, since `JobState` does not own raw memory and cannot perform
    /// the restore itself -- see [`crate::ffi`] for the real memcpy.
    pub fn rollback(&self) -> Vec<(Addr, Box<[u8]>)> {
        let inner = self.inner.lock();
        inner
            .undo
            .iter()
            .map(|(&addr, entry)| (addr, entry.saved_bytes.clone()))
            .collect()
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}
