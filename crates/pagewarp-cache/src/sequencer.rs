//! Bounded worker pool with cooperative FIFO sequences.
//!
//! A [`Sequence`] is a queue of tasks of which at most one runs at a time,
//! though successive tasks may run on different pool threads. Sequences are
//! the unit of serialization for everything asynchronous in this crate: the
//! async cache wrapper funnels all backend I/O through one sequence, and the
//! purge writer schedules its file updates on another.
//!
//! Every task carries a cancel arm. Exactly one of the two arms runs:
//! `run` when the pool executes the task, `cancel` when the task is shed
//! for overflow, sequence shutdown, or pool shutdown.

use crate::error::{CacheError, CacheResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// A unit of work with distinct execute and cancel arms.
pub trait SequenceTask: Send {
    /// Execute the task. Runs on a pool thread.
    fn run(self: Box<Self>);

    /// Called instead of [`SequenceTask::run`] when the task will never
    /// run. May run on the enqueuing thread or a pool thread.
    fn cancel(self: Box<Self>) {}
}

struct FnTask<R, C> {
    run: R,
    cancel: Option<C>,
}

impl<R: FnOnce() + Send, C: FnOnce() + Send> SequenceTask for FnTask<R, C> {
    fn run(self: Box<Self>) {
        (self.run)();
    }

    fn cancel(self: Box<Self>) {
        if let Some(cancel) = self.cancel {
            cancel();
        }
    }
}

/// Build a task from separate run and cancel closures.
pub fn task_fn<R, C>(run: R, cancel: C) -> Box<dyn SequenceTask>
where
    R: FnOnce() + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    Box::new(FnTask {
        run,
        cancel: Some(cancel),
    })
}

/// Build a task whose cancel arm is a no-op, for fire-and-forget work.
pub fn task_only<R>(run: R) -> Box<dyn SequenceTask>
where
    R: FnOnce() + Send + 'static,
{
    Box::new(FnTask {
        run,
        cancel: None::<fn()>,
    })
}

/// Unlimited queue depth.
const UNBOUNDED: usize = usize::MAX;

struct SequenceState {
    queue: VecDeque<Box<dyn SequenceTask>>,
    /// A pool thread is currently executing a task from this sequence.
    running: bool,
    /// This sequence is sitting in the pool's runnable list.
    scheduled: bool,
    shutdown: bool,
    max_queue_size: usize,
}

/// A FIFO task queue serialized by the pool: at most one task of a
/// sequence is ever running.
pub struct Sequence {
    state: Mutex<SequenceState>,
    pool: Arc<PoolInner>,
    /// Back-reference so the sequence can place itself on the runnable
    /// list. Always upgradable while any caller holds the sequence.
    self_ref: Weak<Sequence>,
}

impl Sequence {
    /// Cap the pending-task depth. When an add would exceed the cap, the
    /// oldest queued tasks are cancelled to make room.
    pub fn set_max_queue_size(&self, max_queue_size: usize) {
        self.state.lock().max_queue_size = max_queue_size;
    }

    /// Append a task. If the sequence or pool is shut down, the task's
    /// cancel arm runs instead, on this thread.
    pub fn add(&self, task: Box<dyn SequenceTask>) {
        let mut overflow: Vec<Box<dyn SequenceTask>> = Vec::new();
        let mut rejected = None;
        let mut schedule = false;
        {
            let mut state = self.state.lock();
            if state.shutdown || self.pool.is_shut_down() {
                rejected = Some(task);
            } else {
                state.queue.push_back(task);
                while state.queue.len() > state.max_queue_size {
                    if let Some(oldest) = state.queue.pop_front() {
                        overflow.push(oldest);
                    }
                }
                if !state.running && !state.scheduled && !state.queue.is_empty() {
                    state.scheduled = true;
                    schedule = true;
                }
            }
        }
        if let Some(task) = rejected {
            task.cancel();
            return;
        }
        if !overflow.is_empty() {
            debug!(count = overflow.len(), "sequence overflow, cancelling oldest tasks");
        }
        for task in overflow {
            task.cancel();
        }
        if schedule {
            if let Some(me) = self.self_ref.upgrade() {
                self.pool.schedule_arc(me);
            }
        }
    }

    /// Cancel every task that has not started running.
    pub fn cancel_pending_tasks(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.queue.drain(..).collect()
        };
        for task in drained {
            task.cancel();
        }
    }

    /// Stop accepting tasks and cancel everything pending. A task already
    /// running is allowed to finish.
    pub fn shut_down(&self) {
        self.state.lock().shutdown = true;
        self.cancel_pending_tasks();
    }

    /// Number of tasks waiting to run (excludes a currently running task).
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Pop the next task and mark the sequence running. Pool-side.
    fn take_next(&self) -> Option<Box<dyn SequenceTask>> {
        let mut state = self.state.lock();
        state.scheduled = false;
        let task = state.queue.pop_front();
        state.running = task.is_some();
        task
    }

    /// Mark the task finished; reschedule if more work is queued. Pool-side.
    fn task_finished(&self) -> bool {
        let mut state = self.state.lock();
        state.running = false;
        if !state.queue.is_empty() && !state.scheduled && !state.shutdown {
            state.scheduled = true;
            return true;
        }
        false
    }
}

struct PoolState {
    runnable: VecDeque<Arc<Sequence>>,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    /// Runnable-list depth beyond which the oldest waiting sequences are
    /// shed entirely. `UNBOUNDED` disables shedding.
    load_shed_threshold: usize,
}

impl PoolInner {
    fn is_shut_down(&self) -> bool {
        self.state.lock().shutdown
    }

    fn schedule_arc(&self, sequence: Arc<Sequence>) {
        let shed: Vec<Arc<Sequence>> = {
            let mut state = self.state.lock();
            if state.shutdown {
                // Raced with pool shutdown; the tasks will never run.
                drop(state);
                sequence.state.lock().scheduled = false;
                sequence.cancel_pending_tasks();
                return;
            }
            state.runnable.push_back(sequence);
            let mut shed = Vec::new();
            while state.runnable.len() > self.load_shed_threshold {
                if let Some(oldest) = state.runnable.pop_front() {
                    shed.push(oldest);
                }
            }
            shed
        };
        for sequence in &shed {
            warn!("worker pool over capacity, shedding oldest sequence");
            sequence.state.lock().scheduled = false;
            sequence.cancel_pending_tasks();
        }
        self.work_ready.notify_one();
    }
}

/// Fixed-size thread pool executing [`Sequence`] tasks.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn a pool of `num_threads` workers with no load shedding.
    pub fn new(num_threads: usize) -> CacheResult<Self> {
        Self::with_load_shed_threshold(num_threads, UNBOUNDED)
    }

    /// Spawn a pool that sheds the oldest waiting sequences whenever more
    /// than `load_shed_threshold` sequences are runnable at once.
    pub fn with_load_shed_threshold(
        num_threads: usize,
        load_shed_threshold: usize,
    ) -> CacheResult<Self> {
        if num_threads == 0 {
            return Err(CacheError::InvalidConfiguration(
                "worker pool needs at least one thread".to_string(),
            ));
        }
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                runnable: VecDeque::new(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            load_shed_threshold,
        });
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("cache-worker-{i}"))
                .spawn(move || worker_loop(&inner))?;
            workers.push(handle);
        }
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Create a new sequence served by this pool.
    pub fn new_sequence(&self) -> Arc<Sequence> {
        Arc::new_cyclic(|self_ref| Sequence {
            state: Mutex::new(SequenceState {
                queue: VecDeque::new(),
                running: false,
                scheduled: false,
                shutdown: false,
                max_queue_size: UNBOUNDED,
            }),
            pool: Arc::clone(&self.inner),
            self_ref: self_ref.clone(),
        })
    }

    /// Stop accepting work. Running tasks finish; queued tasks are
    /// cancelled. Does not wait for the workers to exit.
    pub fn initiate_shutdown(&self) {
        let drained: Vec<Arc<Sequence>> = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.runnable.drain(..).collect()
        };
        self.inner.work_ready.notify_all();
        for sequence in &drained {
            sequence.state.lock().scheduled = false;
            sequence.cancel_pending_tasks();
        }
    }

    /// Block until every worker thread has exited. Must follow
    /// [`WorkerPool::initiate_shutdown`].
    pub fn wait_for_shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }

    /// Two-phase shutdown: reject new work, then drain and join.
    pub fn shut_down(&self) {
        self.initiate_shutdown();
        self.wait_for_shutdown();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shut_down();
    }
}

fn worker_loop(pool: &Arc<PoolInner>) {
    loop {
        let sequence = {
            let mut state = pool.state.lock();
            loop {
                if let Some(sequence) = state.runnable.pop_front() {
                    break sequence;
                }
                if state.shutdown {
                    return;
                }
                pool.work_ready.wait(&mut state);
            }
        };
        if let Some(task) = sequence.take_next() {
            task.run();
            let reschedule = sequence.task_finished();
            if reschedule {
                pool.schedule_arc(Arc::clone(&sequence));
            }
        }
    }
}
