//! # Strand
//!
//! A serialized execution context on top of the shared worker pool: tasks
//! posted to a strand run one at a time, in FIFO order, on whichever worker
//! happens to pick the strand up. At most one worker drains a given strand
//! at any instant.
//!
//! The construction is the usual drain-and-repost protocol: a lock-free
//! pending queue plus a `scheduled` flag. Whoever flips the flag from idle
//! posts a single drainer task to the executor; the drainer runs a bounded
//! batch and reposts itself while work remains, so one busy strand cannot
//! starve the pool.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::executor::{Executor, Task};

/// Tasks executed per drainer run before the strand yields the worker.
const DRAIN_BATCH: usize = 64;

thread_local! {
    /// The strand the current worker is draining, if any.
    static ACTIVE: RefCell<Option<Strand>> = const { RefCell::new(None) };
}

/// Handle to a serialized task queue. Cheap to clone; clones are identical.
#[derive(Clone)]
pub struct Strand {
    core: Arc<StrandCore>,
}

struct StrandCore {
    id: u64,
    exec: Executor,
    pending: SegQueue<Task>,
    scheduled: AtomicBool,
}

impl PartialEq for Strand {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Strand {}

impl Strand {
    pub(crate) fn new(exec: Executor, id: u64) -> Self {
        Self {
            core: Arc::new(StrandCore {
                id,
                exec,
                pending: SegQueue::new(),
                scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// The strand the calling worker is currently draining, if any.
    pub fn current() -> Option<Strand> {
        ACTIVE.with(|a| a.borrow().clone())
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn executor(&self) -> &Executor {
        &self.core.exec
    }

    /// True iff the calling worker is currently executing a task of this
    /// strand.
    pub fn running_in_this_thread(&self) -> bool {
        ACTIVE.with(|a| a.borrow().as_ref().map(|s| s == self).unwrap_or(false))
    }

    /// Enqueue a task; execution is always deferred.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.post_boxed(Box::new(task));
    }

    pub(crate) fn post_boxed(&self, task: Task) {
        self.core.pending.push(task);
        self.try_schedule();
    }

    /// Run the task inline when the caller is already on this strand,
    /// otherwise post it.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        if self.running_in_this_thread() {
            task();
        } else {
            self.post(task);
        }
    }

    /// Execute `f` on this strand and block the calling thread for the
    /// result. Runs inline when already on the strand; otherwise the caller
    /// must not be a worker of this executor, or it could wait on itself.
    pub fn sync_invoke<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.running_in_this_thread() {
            return f();
        }
        debug_assert!(
            !self.core.exec.running_in_this_executor(),
            "sync_invoke from a worker thread can deadlock the pool"
        );
        let (tx, rx) = flume::bounded(1);
        self.post(move || {
            let _ = tx.send(f());
        });
        rx.recv().expect("executor closed during sync_invoke")
    }

    /// Execute `f` on this strand; once it returns, run `then(result)` back
    /// on the caller's strand. Must be called from a strand.
    pub fn async_invoke<R, F, C>(&self, f: F, then: C)
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        C: FnOnce(R) + Send + 'static,
    {
        let caller = Strand::current();
        debug_assert!(caller.is_some(), "async_invoke requires a calling strand");
        self.post(move || {
            let r = f();
            match &caller {
                Some(back) => back.post(move || then(r)),
                None => then(r),
            }
        });
    }

    /// [`async_invoke`](Self::async_invoke) for callables without a result.
    pub fn async_invoke_void<F, C>(&self, f: F, then: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.async_invoke(f, move |()| then());
    }

    fn try_schedule(&self) {
        if self
            .core
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let this = self.clone();
            self.core.exec.post(Box::new(move || this.drain()));
        }
    }

    fn drain(&self) {
        let prev = ACTIVE.with(|a| a.borrow_mut().replace(self.clone()));
        let mut executed = 0;
        let mut more = false;
        loop {
            match self.core.pending.pop() {
                Some(task) => {
                    task();
                    executed += 1;
                    if executed >= DRAIN_BATCH {
                        more = true;
                        break;
                    }
                }
                None => break,
            }
        }
        ACTIVE.with(|a| *a.borrow_mut() = prev);

        if more {
            // Keep the scheduled flag held and hand the tail to a fresh task.
            let this = self.clone();
            self.core.exec.post(Box::new(move || this.drain()));
            return;
        }
        self.core.scheduled.store(false, Ordering::Release);
        if !self.core.pending.is_empty() {
            self.try_schedule();
        }
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("id", &self.core.id)
            .field("scheduled", &self.core.scheduled.load(Ordering::Relaxed))
            .finish()
    }
}
