//! One loop iteration dispatched by the scheduler.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crossbeam_utils::CachePadded;

use crate::timestamp::Timestamp;

/// Opaque pointer into the marshalled-live-ins scope array (or, for the
/// top-level call, the original argument pointer). Never dereferenced by the
/// scheduler itself -- only by the extracted body it invokes and by the FFI
/// layer's instrumentation callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawScope(pub usize);

impl RawScope {
    pub fn null() -> Self {
        RawScope(0)
    }

    pub fn as_addr(self) -> usize {
        self.0
    }
}

// Every worker hits this on each task dispatch; cache-line padding keeps its
// contention from spilling into whatever happens to sit next to it in
// `.bss`.
static TASK_ID_COUNTER: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));

/// Process-wide unique identifier for a [`Task`], independent of its
/// timestamp -- used as a hashable/orderable key in sets and maps where the
/// timestamp itself would be an unnecessarily large key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// A single loop iteration: an induction value, a marshalled-args pointer,
/// and (once it spawns a nested loop) a newly-marshalled nested scope.
pub struct Task {
    id: TaskId,
    indvar: i64,
    args: RawScope,
    new_scope: parking_lot::Mutex<Option<RawScope>>,
    timestamp: Timestamp,
    job_id: crate::job::JobId,
}

impl Task {
    pub fn root(indvar: i64, args: RawScope, job_id: crate::job::JobId) -> Self {
        Task {
            id: TaskId::next(),
            indvar,
            args,
            new_scope: parking_lot::Mutex::new(None),
            timestamp: Timestamp::root(indvar),
            job_id,
        }
    }

    pub fn child(parent: &Task, indvar: i64, args: RawScope, job_id: crate::job::JobId) -> Self {
        Task {
            id: TaskId::next(),
            indvar,
            args,
            new_scope: parking_lot::Mutex::new(None),
            timestamp: parent.timestamp.child(indvar),
            job_id,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn indvar(&self) -> i64 {
        self.indvar
    }

    pub fn args(&self) -> RawScope {
        self.args
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn job_id(&self) -> crate::job::JobId {
        self.job_id
    }

    /// Set the scope this task marshalled for a nested loop it spawned. A
    /// task spawns at most one nested loop's worth of child tasks in this
    /// model, matching the original's `setNewScope`.
    pub fn set_new_scope(&self, scope: RawScope) {
        *self.new_scope.lock() = Some(scope);
    }

    pub fn new_scope(&self) -> Option<RawScope> {
        *self.new_scope.lock()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Task {}

/// Tasks are ordered by timestamp; the scheduler pops the minimum-timestamp
/// task first within a job, so this is a plain (not reversed) ordering --
/// callers wrap in [`std::cmp::Reverse`] where a min-heap is needed.
impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    #[test]
    fn root_task_has_single_entry_timestamp() {
        let t = Task::root(3, RawScope::null(), JobId::for_test(0));
        assert_eq!(t.timestamp().entries(), &[3]);
    }

    #[test]
    fn child_task_extends_parent_timestamp() {
        let parent = Task::root(1, RawScope::null(), JobId::for_test(0));
        let child = Task::child(&parent, 2, RawScope::null(), JobId::for_test(1));
        assert_eq!(child.timestamp().entries(), &[1, 2]);
    }

    #[test]
    fn ordering_follows_timestamp() {
        let a = Task::root(1, RawScope::null(), JobId::for_test(0));
        let b = Task::root(2, RawScope::null(), JobId::for_test(0));
        assert!(a < b);
    }

    #[test]
    fn ids_are_distinct() {
        let a = Task::root(1, RawScope::null(), JobId::for_test(0));
        let b = Task::root(1, RawScope::null(), JobId::for_test(0));
        assert_ne!(a.id(), b.id());
    }
}
