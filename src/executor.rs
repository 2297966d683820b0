//! # Executor
//!
//! The bottom level of the two-level scheduler: a fixed pool of worker
//! threads draining a single ready queue, plus a deadline-ordered timer
//! service that feeds expired tasks back into that queue.
//!
//! ## Key Concepts
//! - Ready queue: one MPMC channel shared by all workers
//! - Anchor: a sender kept by the executor itself so the queue stays alive
//!   while the executor is open, even when idle
//! - Timer service: a dedicated thread over a deadline heap with lazy
//!   cancellation
//!
//! Strands (`crate::strand`) serialize on top of this pool; nothing at this
//! level orders tasks beyond queue FIFO.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use tracing::{debug, warn};

use crate::strand::Strand;

/// A unit of work handed to the pool.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Requested OS scheduling priority for the worker threads.
///
/// The executor records the knob and surfaces it through [`Executor::priority`];
/// actually applying it to the underlying threads belongs to the embedder,
/// which owns the OS-specific thread controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle,
    Lowest,
    BelowNormal,
    Normal,
    AboveNormal,
    Highest,
    TimeCritical,
}

/// Opaque handle for a scheduled timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

/// Worker-pool executor. Cheap to clone; all clones address the same pool.
#[derive(Clone)]
pub struct Executor {
    core: Arc<ExecutorCore>,
}

struct ExecutorCore {
    /// The anchor. `Some` while open; dropping it lets workers drain and exit.
    queue: RwLock<Option<flume::Sender<Task>>>,
    shared: Mutex<ExecShared>,
    threads: RwLock<HashSet<ThreadId>>,
    gate: Gate,
    timers: TimerService,
    run_count: AtomicU64,
    next_strand_id: AtomicU64,
}

struct ExecShared {
    open: bool,
    workers: Vec<JoinHandle<()>>,
    timer_thread: Option<JoinHandle<()>>,
    priority: Priority,
    affinity: Option<u64>,
}

/// Cooperative pause point between tasks. `suspend` raises the gate, workers
/// park on it before picking the next task; `resume` drops it.
struct Gate {
    paused: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn pause_point(&self) {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.cv.wait(paused).unwrap();
        }
    }

    fn set(&self, value: bool) {
        *self.paused.lock().unwrap() = value;
        if !value {
            self.cv.notify_all();
        }
    }
}

impl Executor {
    /// Create a closed executor. Call [`open`](Self::open) before use.
    pub fn new() -> Self {
        Self {
            core: Arc::new(ExecutorCore {
                queue: RwLock::new(None),
                shared: Mutex::new(ExecShared {
                    open: false,
                    workers: Vec::new(),
                    timer_thread: None,
                    priority: Priority::Normal,
                    affinity: None,
                }),
                threads: RwLock::new(HashSet::new()),
                gate: Gate::new(),
                timers: TimerService::new(),
                run_count: AtomicU64::new(0),
                next_strand_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start `thread_count` workers and the timer service. Blocks until every
    /// worker is parked on the ready queue. No-op if already open.
    pub fn open(&self, thread_count: usize) {
        debug_assert!(thread_count >= 1);
        let mut shared = self.core.shared.lock().unwrap();
        if shared.open {
            warn!("executor already open");
            return;
        }
        shared.open = true;

        let (tx, rx) = flume::unbounded::<Task>();
        *self.core.queue.write().unwrap() = Some(tx);

        let ready = Arc::new(Barrier::new(thread_count + 1));
        for i in 0..thread_count {
            let core = self.core.clone();
            let rx = rx.clone();
            let ready = ready.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{i}"))
                .spawn(move || {
                    core.threads.write().unwrap().insert(thread::current().id());
                    ready.wait();
                    while let Ok(task) = rx.recv() {
                        core.gate.pause_point();
                        // A panicking task must not take the worker down.
                        if let Err(payload) =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(task))
                        {
                            let what = payload
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| payload.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "non-string panic payload".into());
                            tracing::error!(worker = i, panic = %what, "task panicked");
                        }
                        core.run_count.fetch_add(1, Ordering::Relaxed);
                    }
                    core.threads.write().unwrap().remove(&thread::current().id());
                })
                .expect("failed to spawn worker thread");
            shared.workers.push(handle);
        }
        drop(rx);

        self.core.timers.set_open(true);
        let weak = Arc::downgrade(&self.core);
        let timer_handle = thread::Builder::new()
            .name("weft-timer".into())
            .spawn(move || TimerService::run(weak))
            .expect("failed to spawn timer thread");
        shared.timer_thread = Some(timer_handle);
        drop(shared);

        ready.wait();
        debug!(workers = thread_count, "executor open");
    }

    /// Drain and shut down. Tasks already queued (and timer entries already
    /// expired into the queue) complete before this returns; pending timer
    /// entries are discarded. Must not be called from a worker.
    pub fn close(&self) {
        debug_assert!(!self.running_in_this_executor());
        let mut shared = self.core.shared.lock().unwrap();
        if !shared.open {
            return;
        }
        self.core.timers.set_open(false);
        if let Some(handle) = shared.timer_thread.take() {
            let _ = handle.join();
        }
        // Drop the anchor: the queue disconnects once the last strand-held
        // sender is gone, and workers exit after draining it.
        *self.core.queue.write().unwrap() = None;
        for handle in shared.workers.drain(..) {
            let _ = handle.join();
        }
        shared.open = false;
        debug!("executor closed");
    }

    /// Pause all workers at their next task boundary.
    pub fn suspend(&self) {
        self.core.gate.set(true);
    }

    /// Release workers paused by [`suspend`](Self::suspend).
    pub fn resume(&self) {
        self.core.gate.set(false);
    }

    pub fn is_open(&self) -> bool {
        self.core.shared.lock().unwrap().open
    }

    /// True iff the calling thread is one of this executor's workers.
    pub fn running_in_this_executor(&self) -> bool {
        self.core
            .threads
            .read()
            .unwrap()
            .contains(&thread::current().id())
    }

    pub fn thread_count(&self) -> usize {
        self.core.threads.read().unwrap().len()
    }

    /// Total number of tasks executed since open.
    pub fn run_count(&self) -> u64 {
        self.core.run_count.load(Ordering::Relaxed)
    }

    /// Record the requested worker priority. See [`Priority`].
    pub fn set_priority(&self, priority: Priority) {
        let mut shared = self.core.shared.lock().unwrap();
        shared.priority = priority;
        debug!(?priority, "worker priority requested");
    }

    pub fn priority(&self) -> Priority {
        self.core.shared.lock().unwrap().priority
    }

    /// Record the requested CPU affinity mask for the workers.
    pub fn set_affinity(&self, mask: u64) {
        let mut shared = self.core.shared.lock().unwrap();
        shared.affinity = Some(mask);
        debug!(mask, "worker affinity requested");
    }

    pub fn affinity(&self) -> Option<u64> {
        self.core.shared.lock().unwrap().affinity
    }

    /// Number of physical cores.
    pub fn physical_concurrency() -> usize {
        num_cpus::get_physical()
    }

    /// Number of logical cores.
    pub fn hardware_concurrency() -> usize {
        num_cpus::get()
    }

    /// Build a new strand serialized on this executor.
    pub fn make_strand(&self) -> Strand {
        let id = self.core.next_strand_id.fetch_add(1, Ordering::Relaxed);
        Strand::new(self.clone(), id)
    }

    /// Enqueue a task for the pool. Dropped with a warning if the executor
    /// is closed.
    pub(crate) fn post(&self, task: Task) {
        self.core.post(task);
    }

    /// Schedule `task` to be posted at `deadline`.
    pub(crate) fn schedule(&self, deadline: Instant, task: Task) -> TimerKey {
        self.core.timers.schedule(deadline, task)
    }

    /// Drop a scheduled timer entry. Expired entries are gone already; stale
    /// keys are ignored.
    pub(crate) fn cancel(&self, key: TimerKey) {
        self.core.timers.cancel(key);
    }
}

impl ExecutorCore {
    fn post(&self, task: Task) {
        let queue = self.queue.read().unwrap();
        match queue.as_ref() {
            Some(tx) => {
                let _ = tx.send(task);
            }
            None => warn!("task posted to a closed executor; dropped"),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("open", &self.is_open())
            .field("threads", &self.thread_count())
            .field("run_count", &self.run_count())
            .finish()
    }
}

/// Deadline heap with lazy cancellation: `cancel` removes the task from the
/// entry map, the heap node is discarded when it surfaces.
struct TimerService {
    st: Mutex<TimerState>,
    cv: Condvar,
}

struct TimerState {
    open: bool,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_key: u64,
}

impl TimerService {
    fn new() -> Self {
        Self {
            st: Mutex::new(TimerState {
                open: false,
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_key: 1,
            }),
            cv: Condvar::new(),
        }
    }

    fn set_open(&self, open: bool) {
        let mut st = self.st.lock().unwrap();
        st.open = open;
        if !open {
            st.heap.clear();
            st.tasks.clear();
        }
        self.cv.notify_all();
    }

    fn schedule(&self, deadline: Instant, task: Task) -> TimerKey {
        let mut st = self.st.lock().unwrap();
        let key = st.next_key;
        st.next_key += 1;
        if !st.open {
            warn!("timer scheduled on a closed executor; dropped");
            return TimerKey(key);
        }
        st.tasks.insert(key, task);
        st.heap.push(Reverse((deadline, key)));
        self.cv.notify_one();
        TimerKey(key)
    }

    fn cancel(&self, key: TimerKey) {
        self.st.lock().unwrap().tasks.remove(&key.0);
    }

    fn run(core: Weak<ExecutorCore>) {
        let Some(strong) = core.upgrade() else { return };
        let mut st = strong.timers.st.lock().unwrap();
        loop {
            if !st.open {
                return;
            }
            let now = Instant::now();
            match st.heap.peek().copied() {
                None => {
                    st = strong.timers.cv.wait(st).unwrap();
                }
                Some(Reverse((deadline, key))) if deadline <= now => {
                    st.heap.pop();
                    if let Some(task) = st.tasks.remove(&key) {
                        drop(st);
                        strong.post(task);
                        st = strong.timers.st.lock().unwrap();
                    }
                }
                Some(Reverse((deadline, _))) => {
                    let timeout = deadline.duration_since(now);
                    let (guard, _) = strong.timers.cv.wait_timeout(st, timeout).unwrap();
                    st = guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn open_runs_posted_tasks_and_close_drains() {
        let exec = Executor::new();
        exec.open(2);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let hits = hits.clone();
            exec.post(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        exec.close();
        assert_eq!(hits.load(Ordering::SeqCst), 64);
        assert!(exec.run_count() >= 64);
    }

    #[test]
    fn worker_membership_is_visible_from_tasks() {
        let exec = Executor::new();
        exec.open(1);
        let (tx, rx) = flume::bounded(1);
        let probe = exec.clone();
        exec.post(Box::new(move || {
            tx.send(probe.running_in_this_executor()).unwrap();
        }));
        assert!(rx.recv().unwrap());
        assert!(!exec.running_in_this_executor());
        exec.close();
    }

    #[test]
    fn timer_fires_near_deadline() {
        let exec = Executor::new();
        exec.open(1);
        let (tx, rx) = flume::bounded(1);
        let start = Instant::now();
        exec.schedule(
            start + Duration::from_millis(40),
            Box::new(move || {
                tx.send(Instant::now()).unwrap();
            }),
        );
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let elapsed = fired.duration_since(start);
        assert!(elapsed >= Duration::from_millis(35), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
        exec.close();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let exec = Executor::new();
        exec.open(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let key = exec.schedule(
            Instant::now() + Duration::from_millis(30),
            Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        exec.cancel(key);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        exec.close();
    }

    #[test]
    fn suspend_holds_tasks_until_resume() {
        let exec = Executor::new();
        exec.open(1);
        exec.suspend();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        exec.post(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        exec.resume();
        exec.close();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
