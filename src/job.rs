//! A priority-ordered queue of [`Task`]s sharing one [`JobState`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::job_state::JobState;
use crate::task::{RawScope, Task, TaskId};

/// Function pointer signature an extracted loop body, sequential fallback,
/// or continuation is dispatched through: `(i64 indvar, ptr scope) -> void`,
/// exactly the ABI contract in §6 of the specification. Using a plain `fn`
/// pointer rather than a boxed closure matches the real calling convention
/// compiled code uses and gives jobs a natural identity key (the pointer
/// value itself) for the job registry.
pub type BodyFn = fn(i64, RawScope);

// Allocated once per job (far less often than `TASK_ID_COUNTER`), but kept
// padded for the same reason -- job creation happens on the critical path
// of `enqueue_task` and can race a worker's own counters.
static JOB_PRIORITY_COUNTER: CachePadded<AtomicU32> = CachePadded::new(AtomicU32::new(0));

/// Process-wide unique identifier for a [`Job`]. Lower is higher priority
/// (older jobs run first), matching the monotonic allocation the original
/// specification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u32);

impl JobId {
    fn next() -> Self {
        JobId(JOB_PRIORITY_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn priority(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub fn for_test(priority: u32) -> Self {
        JobId(priority)
    }
}

/// Wraps a `Task` for storage in the min-heap: ties are broken by `TaskId`
/// insertion order, since two distinct live tasks never share a timestamp
/// but the heap still needs a total order.
struct TaskOrd(Arc<Task>);

impl PartialEq for TaskOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp() == other.0.timestamp()
    }
}
impl Eq for TaskOrd {}
impl PartialOrd for TaskOrd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TaskOrd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .timestamp()
            .cmp(other.0.timestamp())
            .then_with(|| self.0.id().cmp(&other.0.id()))
    }
}

/// The task queue and the barrier-arrival count, held behind one mutex so
/// that "is the queue empty" and "am I the last worker to notice" are
/// decided atomically -- matching the original's single `m_mutex` scope
/// across both checks.
struct QueueState {
    queue: BinaryHeap<Reverse<TaskOrd>>,
    waiting_threads: usize,
}

/// Outcome of [`Job::pop_task`].
pub enum PopOutcome {
    /// A task to run.
    Task(Arc<Task>),
    /// The queue is empty or the job has failed; the calling worker has
    /// registered itself as waiting. If it was the last worker to do so,
    /// `finished` is `true` and the caller must call
    /// [`crate::pool::ThreadPool::finish_job`] and then
    /// [`Job::signal_barrier`]; otherwise the caller should
    /// [`Job::wait_barrier`].
    Parked { finished: bool },
}

/// A job: one extracted parallel body, its task queue, and the job state it
/// shares with its tasks. Jobs form a parent-to-children forest; a job only
/// becomes active once its parent has finished.
pub struct Job {
    id: JobId,
    pub parallel: BodyFn,
    pub sequential: Option<BodyFn>,
    pub continuation: Option<BodyFn>,
    pub parent: Option<JobId>,
    pub state: Arc<JobState>,
    queue_state: Mutex<QueueState>,
    parent_tasks: Mutex<HashSet<TaskId>>,
    barrier_done: Mutex<bool>,
    barrier_cvar: Condvar,
}

impl Job {
    pub fn new(
        parallel: BodyFn,
        sequential: Option<BodyFn>,
        continuation: Option<BodyFn>,
        parent: Option<JobId>,
        state: Arc<JobState>,
    ) -> Self {
        Job {
            id: JobId::next(),
            parallel,
            sequential,
            continuation,
            parent,
            state,
            queue_state: Mutex::new(QueueState {
                queue: BinaryHeap::new(),
                waiting_threads: 0,
            }),
            parent_tasks: Mutex::new(HashSet::new()),
            barrier_done: Mutex::new(false),
            barrier_cvar: Condvar::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Identity key for the job registry: the parallel body's function
    /// pointer, cast to an address.
    pub fn body_key(func: BodyFn) -> usize {
        func as usize
    }

    /// Enqueue `task`, recording `parent_task` (the task that spawned it,
    /// if any) as one of this job's parent tasks. A task cannot be added
    /// once the job has already latched a conflict.
    pub fn add_task(&self, task: Arc<Task>, parent_task: Option<TaskId>) {
        if !self.state.no_conflicts() {
            return;
        }
        if let Some(pt) = parent_task {
            self.parent_tasks.lock().insert(pt);
        }
        self.queue_state.lock().queue.push(Reverse(TaskOrd(task)));
    }

    /// Pop the minimum-timestamp task, or register the caller as waiting if
    /// the queue is empty or the job has failed.
    pub fn pop_task(&self, worker_count: usize) -> PopOutcome {
        let mut state = self.queue_state.lock();

        if state.queue.is_empty() || !self.state.no_conflicts() {
            state.waiting_threads += 1;
            let finished = state.waiting_threads == worker_count;
            return PopOutcome::Parked { finished };
        }

        let Reverse(TaskOrd(task)) = state.queue.pop().expect("checked non-empty above");
        PopOutcome::Task(task)
    }

    /// Block until [`Job::signal_barrier`] is called by the worker that
    /// finished this job.
    pub fn wait_barrier(&self) {
        let mut done = self.barrier_done.lock();
        if !*done {
            self.barrier_cvar.wait(&mut done);
        }
    }

    /// Wake every worker parked in [`Job::wait_barrier`].
    pub fn signal_barrier(&self) {
        *self.barrier_done.lock() = true;
        self.barrier_cvar.notify_all();
    }

    /// Snapshot of the tasks that spawned children into this job, used by
    /// `finish_job` to build the continuation job's initial task set.
    pub fn parent_tasks(&self) -> Vec<TaskId> {
        self.parent_tasks.lock().iter().copied().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_state.lock().queue.len()
    }
}
