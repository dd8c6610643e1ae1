//! The fixed worker pool: picks the highest-priority job, drains its task
//! queue, coordinates the barrier at the end of a job, and dispatches
//! continuation/sequential successor jobs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::job::{BodyFn, Job, JobId, PopOutcome};
use crate::job_state::JobState;
use crate::task::{RawScope, Task, TaskId};

/// Fixed worker pool. A process-wide singleton in real compiled-code usage
/// (see [`crate::ffi`]); constructible directly for tests that want an
/// isolated pool.
pub struct ThreadPool {
    config: PoolConfig,
    jobs: Mutex<FxHashMap<JobId, Arc<Job>>>,
    job_by_body: Mutex<FxHashMap<usize, JobId>>,
    active_jobs: Mutex<BTreeSet<JobId>>,
    /// Jobs created with a parent that has not finished yet.
    child_jobs: Mutex<FxHashMap<JobId, Vec<JobId>>>,
    tasks: Mutex<FxHashMap<TaskId, Arc<Task>>>,
    thread_task: Mutex<HashMap<ThreadId, Arc<Task>>>,
    worker_ids: Mutex<Vec<ThreadId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Every idle worker spins on this flag (`worker_loop`'s warm-up loop),
    /// so it is padded to its own cache line to keep that spin from
    /// thrashing whatever the allocator placed next to it.
    ready: CachePadded<AtomicBool>,
    completion: Mutex<Option<bool>>,
    completion_cvar: Condvar,
    /// Heap allocations made via `__malloc`, released on `clear()`.
    allocations: Mutex<Vec<Box<[u8]>>>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Self {
        ThreadPool {
            config,
            jobs: Mutex::new(FxHashMap::default()),
            job_by_body: Mutex::new(FxHashMap::default()),
            active_jobs: Mutex::new(BTreeSet::new()),
            child_jobs: Mutex::new(FxHashMap::default()),
            tasks: Mutex::new(FxHashMap::default()),
            thread_task: Mutex::new(HashMap::new()),
            worker_ids: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            ready: CachePadded::new(AtomicBool::new(false)),
            completion: Mutex::new(None),
            completion_cvar: Condvar::new(),
            allocations: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    fn is_main_thread(&self, tid: ThreadId) -> bool {
        !self.worker_ids.lock().contains(&tid)
    }

    fn task_for_thread(&self, tid: ThreadId) -> Option<Arc<Task>> {
        self.thread_task.lock().get(&tid).cloned()
    }

    /// The task the calling thread is currently executing, if any. Used by
    /// [`crate::ffi`]'s `__check_load_conflict`/`__check_write_conflict` to
    /// find the timestamp a conflict check runs against.
    pub(crate) fn current_task(&self) -> Option<Arc<Task>> {
        self.task_for_thread(thread::current().id())
    }

    /// Look up a job by id, for [`crate::ffi`] to reach its `JobState` from
    /// a `Task`'s `job_id()`.
    pub(crate) fn job(&self, id: JobId) -> Arc<Job> {
        self.jobs.lock()[&id].clone()
    }

    /// Record an allocation so it lives until `clear()`, and return its
    /// backing address. Stands in for `__malloc`'s "lives until pool
    /// teardown" contract.
    pub fn track_allocation(&self, bytes: Box<[u8]>) -> RawScope {
        let addr = bytes.as_ptr() as usize;
        self.allocations.lock().push(bytes);
        RawScope(addr)
    }

    fn get_or_create_job(
        &self,
        parallel: BodyFn,
        sequential: Option<BodyFn>,
        continuation: Option<BodyFn>,
        parent: Option<JobId>,
    ) -> Arc<Job> {
        let key = Job::body_key(parallel);
        let mut by_body = self.job_by_body.lock();
        if let Some(&id) = by_body.get(&key) {
            return self.jobs.lock()[&id].clone();
        }

        let state = Arc::new(JobState::new());
        let job = Arc::new(Job::new(parallel, sequential, continuation, parent, state));
        by_body.insert(key, job.id());
        self.jobs.lock().insert(job.id(), job.clone());

        match parent {
            Some(parent_id) => {
                self.child_jobs.lock().entry(parent_id).or_default().push(job.id());
            }
            None => {
                self.active_jobs.lock().insert(job.id());
            }
        }
        debug!(job = job.id().priority(), ?parent, "created job");
        job
    }

    /// Create a job that shares an existing `JobState` (used for
    /// continuation/sequential successor jobs, which track conflicts in the
    /// parent scope's state rather than a fresh one).
    fn create_successor_job(
        &self,
        func: BodyFn,
        parent: JobId,
        state: Arc<JobState>,
    ) -> Arc<Job> {
        let job = Arc::new(Job::new(func, None, None, Some(parent), state));
        self.jobs.lock().insert(job.id(), job.clone());
        self.child_jobs.lock().entry(parent).or_default().push(job.id());
        debug!(job = job.id().priority(), parent = parent.priority(), "created successor job");
        job
    }

    /// `__enqueue_task`'s core: enqueue one task per value in
    /// `start, start+step, .., <final`, lazily creating the job, then -- if
    /// the calling thread is the main thread -- block until every
    /// descendant job completes and return whether no conflict was ever
    /// observed.
    ///
    /// Takes `self: &Arc<Self>` rather than `&self` so worker threads can be
    /// spawned holding their own `Arc` clone of the pool, with no unsafe
    /// pointer aliasing required to satisfy `thread::spawn`'s `'static`
    /// bound.
    pub fn enqueue_task(
        self: &Arc<Self>,
        parallel: BodyFn,
        sequential: Option<BodyFn>,
        continuation: Option<BodyFn>,
        args: RawScope,
        new_scope: RawScope,
        start: i64,
        step: i64,
        final_: i64,
    ) -> bool {
        assert!(step > 0, "non-constant/non-positive step must be rejected by the transformer");
        let tid = thread::current().id();

        let parent_task = self.task_for_thread(tid);
        let parent_job = parent_task.as_ref().map(|t| t.job_id());
        let job = self.get_or_create_job(parallel, sequential, continuation, parent_job);

        let mut i = start;
        while i < final_ {
            let (task, parent_task_id) = match &parent_task {
                Some(parent) => {
                    parent.set_new_scope(new_scope);
                    (Arc::new(Task::child(parent, i, args, job.id())), Some(parent.id()))
                }
                None => (Arc::new(Task::root(i, args, job.id())), None),
            };
            self.tasks.lock().insert(task.id(), task.clone());
            job.add_task(task, parent_task_id);
            i += step;
        }

        self.make_ready();

        if self.is_main_thread(tid) {
            let mut completion = self.completion.lock();
            while completion.is_none() {
                self.completion_cvar.wait(&mut completion);
            }
            let result = completion.take().expect("checked Some above");
            drop(completion);
            self.clear();
            result
        } else {
            // Nested dispatch from within an already-running task: the
            // generated body that issued this call discards the return
            // value and simply returns (§4.1 step 6).
            true
        }
    }

    fn make_ready(self: &Arc<Self>) {
        if self.ready.load(Ordering::Acquire) {
            return;
        }
        let mut workers = self.workers.lock();
        if self.ready.load(Ordering::Acquire) {
            return;
        }
        let mut ids = self.worker_ids.lock();
        for _ in 0..self.config.worker_count {
            let pool = self.clone();
            let handle = thread::spawn(move || pool.worker_loop());
            ids.push(handle.thread().id());
            workers.push(handle);
        }
        self.ready.store(true, Ordering::Release);
    }

    fn worker_loop(&self) {
        loop {
            while !self.ready.load(Ordering::Acquire) {
                thread::yield_now();
            }

            let job = {
                let active = self.active_jobs.lock();
                match active.iter().next().copied() {
                    Some(id) => self.jobs.lock()[&id].clone(),
                    None => break,
                }
            };

            match job.pop_task(self.config.worker_count) {
                PopOutcome::Task(task) => {
                    self.thread_task.lock().insert(thread::current().id(), task.clone());
                    (job.parallel)(task.indvar(), task.args());
                }
                PopOutcome::Parked { finished } => {
                    if finished {
                        self.finish_job(job.id());
                        job.signal_barrier();
                    } else {
                        job.wait_barrier();
                    }
                }
            }
        }
    }

    /// Runs when every worker has parked on `job`'s barrier: rolls back on
    /// failure, dispatches the continuation or sequential successor job,
    /// removes `job` from the active set, promotes its queued children on
    /// success, and fulfills the pool's overall completion signal once no
    /// job remains active.
    fn finish_job(&self, job_id: JobId) {
        let job = self.jobs.lock()[&job_id].clone();
        let succeeded = job.state.no_conflicts();

        if !succeeded {
            warn!(job = job_id.priority(), "job failed, rolling back");
            for (addr, bytes) in job.state.rollback() {
                // SAFETY: `addr` was captured from a `Box<[u8]>`/argument
                // pointer that is still live (the owning task has not been
                // dropped; tasks are only released at pool teardown), and
                // `bytes.len()` is exactly the span the original write
                // covered.
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
                }
            }
        } else {
            debug!(job = job_id.priority(), "job succeeded");
        }

        let mut successor_id = None;
        if job.continuation.is_some() || job.sequential.is_some() {
            let successor_func = if succeeded { job.continuation } else { job.sequential }
                .expect("a job with a continuation must also have a sequential fallback");
            let parent_id = job.parent.expect("successor job requires a parent scope");
            let parent_state = self.jobs.lock()[&parent_id].state.clone();
            let successor = self.create_successor_job(successor_func, job_id, parent_state);
            successor_id = Some(successor.id());

            for parent_task_id in job.parent_tasks() {
                let parent_task = self.tasks.lock()[&parent_task_id].clone();
                let scope = if succeeded {
                    parent_task.new_scope().expect("successful job must have marshalled a new scope")
                } else {
                    parent_task.args()
                };
                let new_task = Arc::new(Task::child(&parent_task, parent_task.indvar(), scope, successor.id()));
                self.tasks.lock().insert(new_task.id(), new_task.clone());
                successor.add_task(new_task, None);
            }
        }

        let mut active = self.active_jobs.lock();
        if active.first() != Some(&job_id) {
            warn!(
                job = job_id.priority(),
                front = active.first().map(|j| j.priority()),
                "finished job is not at front of the active-job set"
            );
        }
        active.remove(&job_id);

        if succeeded {
            // Promotes every job that was queued as a child of this one,
            // including the continuation successor created above (it was
            // registered into the same `child_jobs[job_id]` bucket by
            // `create_successor_job`).
            if let Some(children) = self.child_jobs.lock().remove(&job_id) {
                for child in children {
                    active.insert(child);
                }
            }
        } else if let Some(id) = successor_id {
            // `job` failed: only its sequential fallback gets to run. Any
            // other jobs nested under `job`'s (now rolled-back) tasks stay
            // parked in `child_jobs` forever -- their parent iteration never
            // committed, so per §3 they never become active.
            active.insert(id);
        }

        let pool_done = active.is_empty();
        drop(active);

        if pool_done {
            info!(success = succeeded, "all jobs finished");
            *self.completion.lock() = Some(succeeded);
            self.completion_cvar.notify_all();
        }
    }

    /// Join every worker thread and release all per-run state. Asserts the
    /// active-job set is empty, matching the original's teardown
    /// precondition.
    fn clear(&self) {
        assert!(self.active_jobs.lock().is_empty(), "cleared pool with active jobs remaining");

        self.ready.store(false, Ordering::Release);
        for handle in self.workers.lock().drain(..) {
            handle.join().expect("worker thread panicked");
        }

        self.job_by_body.lock().clear();
        self.thread_task.lock().clear();
        self.worker_ids.lock().clear();
        self.jobs.lock().clear();
        self.tasks.lock().clear();
        self.child_jobs.lock().clear();
        self.allocations.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn config(workers: usize) -> PoolConfig {
        PoolConfig { worker_count: workers }
    }

    #[test]
    fn independent_iterations_all_run_and_pool_ends_idle() {
        static SUM: AtomicI64 = AtomicI64::new(0);
        fn body(i: i64, _scope: RawScope) {
            SUM.fetch_add(i, Ordering::Relaxed);
        }

        let pool = Arc::new(ThreadPool::new(config(4)));
        let ok = pool.enqueue_task(body, None, None, RawScope::null(), RawScope::null(), 0, 1, 100);
        assert!(ok);
        assert_eq!(SUM.load(Ordering::Relaxed), (0..100).sum::<i64>());
        assert!(pool.active_jobs.lock().is_empty());
        assert!(pool.workers.lock().is_empty());
    }

    #[test]
    fn empty_range_enqueues_nothing_and_still_completes() {
        fn body(_i: i64, _scope: RawScope) {
            panic!("should never run");
        }
        let pool = Arc::new(ThreadPool::new(config(2)));
        let ok = pool.enqueue_task(body, None, None, RawScope::null(), RawScope::null(), 10, 1, 10);
        assert!(ok);
    }

    /// Regression test for a bug where `finish_job` only promoted a job's
    /// queued children -- including the successor job it had just created --
    /// when the job *succeeded*. A sequential fallback is created precisely
    /// when a job *fails*, so the old code left it registered in
    /// `child_jobs` forever and it never ran.
    #[test]
    fn failed_job_promotes_its_sequential_fallback_to_active() {
        fn outer_body(_i: i64, _scope: RawScope) {}
        fn inner_parallel_body(_i: i64, _scope: RawScope) {}
        fn sequential_body(_i: i64, _scope: RawScope) {}

        let pool = Arc::new(ThreadPool::new(config(1)));

        // An outer job that has already committed, standing in for the
        // iteration whose nested dispatch is about to fail.
        let outer = pool.get_or_create_job(outer_body, None, None, None);
        let outer_task = Arc::new(Task::root(0, RawScope::null(), outer.id()));
        pool.tasks.lock().insert(outer_task.id(), outer_task.clone());

        // The nested job, parented to `outer`, with a sequential fallback.
        let inner = pool.get_or_create_job(inner_parallel_body, Some(sequential_body), None, Some(outer.id()));
        let inner_task = Arc::new(Task::child(&outer_task, 0, RawScope::null(), inner.id()));
        pool.tasks.lock().insert(inner_task.id(), inner_task.clone());
        inner.add_task(inner_task, Some(outer_task.id()));

        // Force a conflict so `inner.state.no_conflicts()` latches false.
        inner.state.check_and_record_write(0x1000, crate::timestamp::Timestamp::root(5), 1, &[0]);
        inner.state.check_load(0x1000, &crate::timestamp::Timestamp::root(1));
        assert!(!inner.state.no_conflicts());

        pool.finish_job(inner.id());

        let active = pool.active_jobs.lock();
        assert!(active.contains(&outer.id()), "outer job must remain untouched by inner's failure");
        let successor_id = *active
            .iter()
            .find(|&&id| id != outer.id())
            .expect("the sequential fallback job must have been promoted");
        let successor = pool.jobs.lock()[&successor_id].clone();
        assert_eq!(Job::body_key(successor.parallel), Job::body_key(sequential_body));
        assert_eq!(successor.queue_len(), 1, "the fallback must carry over one task per failed parent task");
    }
}
