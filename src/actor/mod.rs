//! # Actor core
//!
//! Lifecycle, supervision links, cancellation, and the in-actor service
//! surface. An actor is a body future pinned to a home strand: all of its
//! state transitions happen either on that strand or from within the body
//! itself, so a single uncontended mutex guards the shared record.
//!
//! ## Key Concepts
//! - Lifecycle: created → `notify_run` → running ⇄ suspended → quited
//! - Cancellation: `notify_quit` marks the actor forced and, once the
//!   quit-lock depth reaches zero, drops the suspended body at its yield
//!   point; registered quit handlers then run in LIFO order
//! - Supervision: parents own children strongly, children point back
//!   weakly; a parent's teardown force-quits every child and waits for all
//!   of them before its own exit callbacks fire
//! - Pause: suspend/resume requests serialize through a queue and recurse
//!   into children, completing only when the whole subtree has settled

pub mod bridge;
pub mod supervision;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::Poll;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::carrier::{
    self, acquire_carrier, free_stack_space, poll_body, release_carrier, validate_stack_size,
    yield_once, Carrier, DEFAULT_STACK_SIZE, STACK_MARGIN,
};
use crate::msg::agent::MsgSlots;
use crate::strand::Strand;
use crate::timer::TimerSlot;

pub use crate::carrier::enable_stack_pool;

/// Process-wide monotonic actor id source. Ids strictly increase for the
/// lifetime of the process.
static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

static AUTO_TIMER_DISABLED: AtomicBool = AtomicBool::new(false);

/// Stop giving new actors a delay slot by default; bodies that need one call
/// [`Actor::open_timer`]. Process-wide, like the stack pool knob.
pub fn disable_auto_make_timer() {
    AUTO_TIMER_DISABLED.store(true, Ordering::Relaxed);
}

type ExitCallback = Box<dyn FnOnce(bool) + Send>;
type DoneCallback = Box<dyn FnOnce() + Send>;

/// Options for spawning an actor.
pub struct SpawnOptions {
    stack_size: usize,
    on_exit: Option<ExitCallback>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            on_exit: None,
        }
    }

    /// Stack budget in bytes: a 4 KiB multiple in 4 KiB..=1 MiB.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Callback fired after the actor has fully exited. `ok` is true iff
    /// the body ran to completion and no force-quit was requested.
    pub fn on_exit(mut self, cb: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(cb));
        self
    }
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized pause/unpause request.
enum PauseOp {
    Suspend(Option<DoneCallback>),
    Resume(Option<DoneCallback>),
    /// Flip the current state; the callback receives the resulting
    /// paused flag.
    Toggle(Option<Box<dyn FnOnce(bool) + Send>>),
}

/// Handle to an actor. Cheap to clone; all clones address the same actor.
///
/// The same handle carries both API surfaces: the yielding methods callable
/// only from inside the body (they `debug_assert` home-strand entry), and
/// the `notify_*` family callable from anywhere.
#[derive(Clone)]
pub struct Actor {
    core: Arc<ActorCore>,
}

pub(crate) struct ActorCore {
    id: u64,
    strand: Strand,
    stack_size: usize,
    /// Worker stack pointer recorded when the strand last entered the body.
    entry_sp: AtomicUsize,
    /// The suspended body lives here, outside the state lock, so polling
    /// never holds it.
    carrier: Mutex<Option<Box<Carrier>>>,
    st: Mutex<ActorShared>,
}

pub(crate) struct ActorShared {
    started: bool,
    quited: bool,
    suspended: bool,
    /// An external wake arrived while paused; replayed on resume.
    has_notify: bool,
    is_force: bool,
    /// A quit arrived while the quit-lock was held; replayed on unlock.
    notify_quited: bool,
    panicked: bool,
    in_actor: bool,
    /// A wake fired while the body was on-stack; re-poll after its yield.
    resume_pending: bool,
    lock_quit: usize,
    yield_count: u64,
    parent: Weak<ActorCore>,
    children: Vec<Actor>,
    quit_handlers: Vec<(u64, DoneCallback)>,
    next_quit_key: u64,
    exit_callbacks: Vec<ExitCallback>,
    exit_result: Option<bool>,
    timer: Option<TimerSlot>,
    pause_queue: VecDeque<PauseOp>,
    child_over_count: usize,
    child_pause_count: usize,
    pub(crate) slots: MsgSlots,
}

/// Scoped quit-lock: cancellation requested while the guard lives is
/// deferred until it drops.
pub struct QuitGuard {
    actor: Actor,
}

impl Drop for QuitGuard {
    fn drop(&mut self) {
        self.actor.unlock_quit();
    }
}

/// Token for a registered quit handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuitKey(u64);

impl Actor {
    // ---------------------------------------------------------------------
    // Spawning

    /// Create an actor on `strand` with default options. The body does not
    /// run until [`notify_run`](Self::notify_run).
    pub fn create<F, Fut>(strand: Strand, body: F) -> Actor
    where
        F: FnOnce(Actor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::create_with(strand, SpawnOptions::new(), body)
    }

    /// Create an actor with explicit [`SpawnOptions`].
    pub fn create_with<F, Fut>(strand: Strand, options: SpawnOptions, body: F) -> Actor
    where
        F: FnOnce(Actor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::create_internal(strand, options, Weak::new(), body)
    }

    pub(crate) fn create_internal<F, Fut>(
        strand: Strand,
        options: SpawnOptions,
        parent: Weak<ActorCore>,
        body: F,
    ) -> Actor
    where
        F: FnOnce(Actor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let stack_size = validate_stack_size(options.stack_size);
        let id = NEXT_ACTOR_ID.fetch_add(1, Ordering::SeqCst);
        let timer = if AUTO_TIMER_DISABLED.load(Ordering::Relaxed) {
            None
        } else {
            Some(TimerSlot::new())
        };
        let mut exit_callbacks = Vec::new();
        if let Some(cb) = options.on_exit {
            exit_callbacks.push(cb);
        }
        let core = Arc::new(ActorCore {
            id,
            strand,
            stack_size,
            entry_sp: AtomicUsize::new(0),
            carrier: Mutex::new(None),
            st: Mutex::new(ActorShared {
                started: false,
                quited: false,
                suspended: false,
                has_notify: false,
                is_force: false,
                notify_quited: false,
                panicked: false,
                in_actor: false,
                resume_pending: false,
                lock_quit: 0,
                yield_count: 0,
                parent,
                children: Vec::new(),
                quit_handlers: Vec::new(),
                next_quit_key: 1,
                exit_callbacks,
                exit_result: None,
                timer,
                pause_queue: VecDeque::new(),
                child_over_count: 0,
                child_pause_count: 0,
                slots: MsgSlots::new(),
            }),
        });
        let actor = Actor { core: core.clone() };
        let mut carrier = acquire_carrier(stack_size);
        carrier.body = Some(Box::pin(body(actor.clone())));
        *core.carrier.lock().unwrap() = Some(carrier);
        debug!(actor = id, "actor created");
        actor
    }

    /// Create on the target strand asynchronously; `on_ready` fires on the
    /// calling strand (or inline when called from outside the pool).
    pub fn async_create<F, Fut>(
        strand: Strand,
        options: SpawnOptions,
        body: F,
        on_ready: impl FnOnce(Actor) + Send + 'static,
    ) where
        F: FnOnce(Actor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let caller = Strand::current();
        let target = strand.clone();
        target.post(move || {
            let actor = Actor::create_with(strand, options, body);
            match caller {
                Some(back) => back.post(move || on_ready(actor)),
                None => on_ready(actor),
            }
        });
    }

    pub(crate) fn from_core(core: Arc<ActorCore>) -> Actor {
        Actor { core }
    }

    pub(crate) fn core(&self) -> &Arc<ActorCore> {
        &self.core
    }

    // ---------------------------------------------------------------------
    // Identity and introspection

    pub fn self_id(&self) -> u64 {
        self.core.id
    }

    pub fn self_strand(&self) -> &Strand {
        &self.core.strand
    }

    pub fn stack_size(&self) -> usize {
        self.core.stack_size
    }

    pub fn is_started(&self) -> bool {
        self.core.st.lock().unwrap().started
    }

    pub fn is_quited(&self) -> bool {
        self.core.st.lock().unwrap().quited
    }

    /// Suspension/resumption pairs performed so far.
    pub fn yield_count(&self) -> u64 {
        self.core.st.lock().unwrap().yield_count
    }

    pub fn reset_yield(&self) {
        self.assert_enter();
        self.core.st.lock().unwrap().yield_count = 0;
    }

    pub fn parent_actor(&self) -> Option<Actor> {
        self.core
            .st
            .lock()
            .unwrap()
            .parent
            .upgrade()
            .map(Actor::from_core)
    }

    /// Snapshot of the live children, in creation order.
    pub fn child_actors(&self) -> Vec<Actor> {
        self.core.st.lock().unwrap().children.clone()
    }

    // ---------------------------------------------------------------------
    // Stack accounting

    /// Bytes left of this actor's stack budget at the current call depth.
    pub fn stack_free_space(&self) -> usize {
        free_stack_space(
            self.core.entry_sp.load(Ordering::Relaxed),
            self.core.stack_size,
        )
    }

    /// Assert the body still has a safe stack margin. Compiled out of
    /// release builds.
    pub fn check_stack(&self) {
        debug_assert!(
            self.stack_free_space() > STACK_MARGIN,
            "actor {} exceeded its stack budget ({} bytes)",
            self.core.id,
            self.core.stack_size
        );
    }

    /// Assert this call is running inside the actor, on its home strand.
    pub fn assert_enter(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.core.strand.running_in_this_thread(),
                "actor API called off the home strand"
            );
            debug_assert!(
                self.core.st.lock().unwrap().in_actor,
                "actor API called from outside the body"
            );
        }
        self.check_stack();
    }

    // ---------------------------------------------------------------------
    // In-actor services

    /// Suspend for `ms` milliseconds. `0` yields fairly (back of the strand
    /// queue); negative is a usage error.
    pub async fn sleep(&self, ms: i64) {
        self.assert_enter();
        if ms < 0 {
            debug_assert!(false, "negative sleep");
            return;
        }
        let core = self.core.clone();
        if ms == 0 {
            let c = core.clone();
            core.strand.post(move || ActorCore::run_one(&c));
        } else {
            let c = core.clone();
            ActorCore::delay_arm(
                &core,
                Duration::from_millis(ms as u64),
                Box::new(move || ActorCore::run_one(&c)),
            );
        }
        yield_once().await;
    }

    /// Run `handler` on the home strand after `ms` milliseconds, through
    /// this actor's delay slot. At most one delay may be pending.
    pub fn delay_trig(&self, ms: i64, handler: impl FnOnce() + Send + 'static) {
        self.assert_enter();
        if ms > 0 {
            ActorCore::delay_arm(&self.core, Duration::from_millis(ms as u64), Box::new(handler));
        } else if ms == 0 {
            self.core.strand.post(handler);
        } else {
            debug_assert!(false, "negative delay");
        }
    }

    /// Drop the pending delay; a late expiry is discarded by generation.
    pub fn cancel_delay_trig(&self) {
        self.assert_enter();
        let key = {
            let mut st = self.core.st.lock().unwrap();
            st.timer.as_mut().and_then(|slot| slot.cancel())
        };
        if let Some(key) = key {
            self.core.strand.executor().cancel(key);
        }
    }

    /// Give this actor a delay slot after [`disable_auto_make_timer`].
    pub fn open_timer(&self) {
        self.assert_enter();
        let mut st = self.core.st.lock().unwrap();
        if st.timer.is_none() {
            st.timer = Some(TimerSlot::new());
        }
    }

    /// Remove the delay slot, cancelling any pending delay.
    pub fn close_timer(&self) {
        self.assert_enter();
        let key = {
            let mut st = self.core.st.lock().unwrap();
            st.timer.take().and_then(|mut slot| slot.cancel())
        };
        if let Some(key) = key {
            self.core.strand.executor().cancel(key);
        }
    }

    /// Defer force-quit while the depth is non-zero. Prefer the scoped
    /// [`quit_guard`](Self::quit_guard).
    pub fn lock_quit(&self) {
        self.assert_enter();
        self.core.st.lock().unwrap().lock_quit += 1;
    }

    /// Balance a [`lock_quit`](Self::lock_quit). Reaching depth zero with a
    /// deferred quit latched replays the quit.
    pub fn unlock_quit(&self) {
        let replay = {
            let mut st = self.core.st.lock().unwrap();
            debug_assert!(st.lock_quit > 0, "unbalanced unlock_quit");
            st.lock_quit = st.lock_quit.saturating_sub(1);
            if st.lock_quit == 0 && st.notify_quited {
                st.notify_quited = false;
                true
            } else {
                false
            }
        };
        if replay {
            let core = self.core.clone();
            self.core
                .strand
                .post(move || ActorCore::force_quit(&core, None));
        }
    }

    /// Scoped quit-lock.
    pub fn quit_guard(&self) -> QuitGuard {
        self.lock_quit();
        QuitGuard {
            actor: self.clone(),
        }
    }

    /// Register a teardown handler. Handlers run in reverse registration
    /// order once the actor quits, after the body has unwound.
    pub fn regist_quit_handler(&self, handler: impl FnOnce() + Send + 'static) -> QuitKey {
        self.assert_enter();
        let mut st = self.core.st.lock().unwrap();
        let key = st.next_quit_key;
        st.next_quit_key += 1;
        st.quit_handlers.push((key, Box::new(handler)));
        QuitKey(key)
    }

    pub fn cancel_quit_handler(&self, key: QuitKey) {
        self.assert_enter();
        self.core
            .st
            .lock()
            .unwrap()
            .quit_handlers
            .retain(|(k, _)| *k != key.0);
    }

    // ---------------------------------------------------------------------
    // Outside control

    /// Start the body. Callable once, from anywhere.
    pub fn notify_run(&self) {
        let core = self.core.clone();
        self.core.strand.post(move || {
            {
                let mut st = core.st.lock().unwrap();
                if st.quited {
                    return;
                }
                debug_assert!(!st.started, "notify_run called twice");
                if st.started {
                    return;
                }
                st.started = true;
                if st.suspended {
                    // Suspended before it ever ran; start on resume.
                    st.has_notify = true;
                    return;
                }
            }
            debug!(actor = core.id, "actor started");
            ActorCore::pull_yield(&core);
        });
    }

    /// Force-quit: cancel the actor at its current (or next) yield point.
    pub fn notify_quit(&self) {
        let core = self.core.clone();
        self.core
            .strand
            .post(move || ActorCore::force_quit(&core, None));
    }

    /// Force-quit with a completion callback; `ok` is false for a forced
    /// exit.
    pub fn notify_quit_with(&self, cb: impl FnOnce(bool) + Send + 'static) {
        let core = self.core.clone();
        self.core
            .strand
            .post(move || ActorCore::force_quit(&core, Some(Box::new(cb))));
    }

    /// Pause the actor and, recursively, its children.
    pub fn notify_suspend(&self) {
        self.enqueue_pause(PauseOp::Suspend(None));
    }

    /// Pause with a completion callback: fires once the whole subtree is
    /// paused.
    pub fn notify_suspend_with(&self, cb: impl FnOnce() + Send + 'static) {
        self.enqueue_pause(PauseOp::Suspend(Some(Box::new(cb))));
    }

    /// Unpause the actor and its children.
    pub fn notify_resume(&self) {
        self.enqueue_pause(PauseOp::Resume(None));
    }

    pub fn notify_resume_with(&self, cb: impl FnOnce() + Send + 'static) {
        self.enqueue_pause(PauseOp::Resume(Some(Box::new(cb))));
    }

    /// Flip between paused and running; the callback receives the resulting
    /// paused state.
    pub fn switch_pause_play(&self) {
        self.enqueue_pause(PauseOp::Toggle(None));
    }

    pub fn switch_pause_play_with(&self, cb: impl FnOnce(bool) + Send + 'static) {
        self.enqueue_pause(PauseOp::Toggle(Some(Box::new(cb))));
    }

    /// Append an exit callback. Fires immediately (with the recorded
    /// result) if the actor has already exited.
    pub fn append_quit_callback(&self, cb: impl FnOnce(bool) + Send + 'static) {
        let core = self.core.clone();
        self.core.strand.post(move || {
            let mut st = core.st.lock().unwrap();
            match st.exit_result {
                Some(ok) => {
                    drop(st);
                    cb(ok);
                }
                None => st.exit_callbacks.push(Box::new(cb)),
            }
        });
    }

    /// Block the calling (non-worker) thread until the actor has exited.
    /// Returns the exit result.
    pub fn outside_wait_quit(&self) -> bool {
        debug_assert!(
            !self.core.strand.executor().running_in_this_executor(),
            "outside_wait_quit from a worker thread can deadlock the pool"
        );
        let (tx, rx) = flume::bounded(1);
        self.append_quit_callback(move |ok| {
            let _ = tx.send(ok);
        });
        rx.recv().unwrap_or(false)
    }

    fn enqueue_pause(&self, op: PauseOp) {
        let core = self.core.clone();
        self.core
            .strand
            .post(move || ActorCore::enqueue_pause(&core, op));
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.core.st.lock().unwrap();
        f.debug_struct("Actor")
            .field("id", &self.core.id)
            .field("started", &st.started)
            .field("quited", &st.quited)
            .field("suspended", &st.suspended)
            .finish()
    }
}

impl ActorCore {
    pub(crate) fn strand(&self) -> &Strand {
        &self.strand
    }

    pub(crate) fn quited(&self) -> bool {
        self.st.lock().unwrap().quited
    }

    pub(crate) fn started(&self) -> bool {
        self.st.lock().unwrap().started
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.st.lock().unwrap().parent.upgrade().is_some()
    }

    pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut ActorShared) -> R) -> R {
        f(&mut self.st.lock().unwrap())
    }

    // ---------------------------------------------------------------------
    // Resumption

    /// Poll the body on the home strand until it suspends or finishes.
    pub(crate) fn pull_yield(core: &Arc<ActorCore>) {
        debug_assert!(core.strand.running_in_this_thread());
        let Some(mut carrier) = core.carrier.lock().unwrap().take() else {
            return;
        };
        let Some(mut body) = carrier.body.take() else {
            *core.carrier.lock().unwrap() = Some(carrier);
            return;
        };
        core.entry_sp
            .store(carrier::approx_stack_pointer(), Ordering::Relaxed);
        loop {
            core.st.lock().unwrap().in_actor = true;
            let polled = catch_unwind(AssertUnwindSafe(|| poll_body(&mut body)));
            let mut st = core.st.lock().unwrap();
            st.in_actor = false;
            match polled {
                Ok(Poll::Pending) => {
                    st.yield_count += 1;
                    if st.resume_pending {
                        // A wake landed while the body was on-stack.
                        st.resume_pending = false;
                        drop(st);
                        continue;
                    }
                    drop(st);
                    carrier.body = Some(body);
                    *core.carrier.lock().unwrap() = Some(carrier);
                    return;
                }
                Ok(Poll::Ready(())) => {
                    st.quited = true;
                    drop(st);
                    drop(body);
                    *core.carrier.lock().unwrap() = Some(carrier);
                    debug!(actor = core.id, "actor body completed");
                    ActorCore::begin_teardown(core);
                    return;
                }
                Err(payload) => {
                    st.quited = true;
                    st.panicked = true;
                    drop(st);
                    let what = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".into());
                    error!(actor = core.id, panic = %what, "actor body panicked");
                    drop(body);
                    *core.carrier.lock().unwrap() = Some(carrier);
                    ActorCore::begin_teardown(core);
                    return;
                }
            }
        }
    }

    /// Resume the actor if it is runnable. Wake sources call this on the
    /// home strand.
    pub(crate) fn run_one(core: &Arc<ActorCore>) {
        {
            let mut st = core.st.lock().unwrap();
            if st.quited || !st.started {
                return;
            }
            if st.suspended {
                st.has_notify = true;
                return;
            }
            if st.in_actor {
                st.resume_pending = true;
                return;
            }
        }
        Self::pull_yield(core);
    }

    // ---------------------------------------------------------------------
    // Delay slot plumbing

    pub(crate) fn delay_arm(core: &Arc<ActorCore>, delay: Duration, handler: DoneCallback) {
        let deadline = Instant::now() + delay;
        let generation = {
            let mut st = core.st.lock().unwrap();
            let Some(slot) = st.timer.as_mut() else {
                debug_assert!(false, "delay used with no timer; call open_timer");
                return;
            };
            slot.arm(deadline, handler)
        };
        let c = core.clone();
        let key = core.strand.executor().schedule(
            deadline,
            Box::new(move || {
                let c2 = c.clone();
                c.strand
                    .post(move || ActorCore::timer_fired(&c2, generation));
            }),
        );
        let mut st = core.st.lock().unwrap();
        if let Some(slot) = st.timer.as_mut() {
            if slot.generation() == generation {
                slot.set_key(key);
            }
        }
    }

    fn timer_fired(core: &Arc<ActorCore>, generation: u64) {
        let handler = {
            let mut st = core.st.lock().unwrap();
            if st.quited {
                None
            } else if st.suspended {
                if let Some(slot) = st.timer.as_mut() {
                    slot.defer_fired(generation);
                }
                None
            } else {
                st.timer.as_mut().and_then(|slot| slot.take_fired(generation))
            }
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    // ---------------------------------------------------------------------
    // Cancellation and teardown

    /// Handle a force-quit request on the home strand.
    pub(crate) fn force_quit(core: &Arc<ActorCore>, cb: Option<ExitCallback>) {
        let proceed = {
            let mut st = core.st.lock().unwrap();
            if let Some(ok) = st.exit_result {
                drop(st);
                if let Some(cb) = cb {
                    cb(ok);
                }
                return;
            }
            if let Some(cb) = cb {
                st.exit_callbacks.push(cb);
            }
            if st.quited {
                // Teardown already under way; the callback rides along and
                // the recorded exit reason stands.
                false
            } else {
                st.is_force = true;
                if st.lock_quit > 0 {
                    st.notify_quited = true;
                    false
                } else {
                    st.quited = true;
                    true
                }
            }
        };
        if proceed {
            debug!(actor = core.id, "actor force-quit");
            Self::begin_teardown(core);
        }
    }

    /// Tear the actor down on its home strand: cancel the delay, unwind the
    /// body, run quit handlers LIFO, detach message endpoints, then
    /// force-quit children and wait for all of them.
    fn begin_teardown(core: &Arc<ActorCore>) {
        let timer_key = {
            let mut st = core.st.lock().unwrap();
            st.timer.as_mut().and_then(|slot| slot.cancel())
        };
        if let Some(key) = timer_key {
            core.strand.executor().cancel(key);
        }

        // Drop the suspended body; wait futures restore channel invariants
        // in their Drop impls.
        if let Some(mut carrier) = core.carrier.lock().unwrap().take() {
            if let Some(body) = carrier.body.take() {
                if catch_unwind(AssertUnwindSafe(move || drop(body))).is_err() {
                    error!(actor = core.id, "panic while unwinding actor body");
                }
            }
            release_carrier(carrier);
        }

        loop {
            let handler = core.st.lock().unwrap().quit_handlers.pop();
            match handler {
                Some((_, h)) => h(),
                None => break,
            }
        }

        let closers = { core.st.lock().unwrap().slots.take_closers() };
        for close in closers {
            close();
        }

        // Unblock anyone waiting on pending pause requests.
        loop {
            let op = core.st.lock().unwrap().pause_queue.pop_front();
            match op {
                Some(PauseOp::Suspend(Some(cb))) | Some(PauseOp::Resume(Some(cb))) => cb(),
                Some(PauseOp::Toggle(Some(cb))) => cb(false),
                Some(_) => {}
                None => break,
            }
        }

        let children = {
            let mut st = core.st.lock().unwrap();
            st.child_over_count = st.children.len();
            st.children.clone()
        };
        if children.is_empty() {
            Self::finish_exit(core);
            return;
        }
        for child in children {
            let parent = core.clone();
            child.notify_quit_with(move |_ok| {
                let p = parent.clone();
                parent.strand.post(move || ActorCore::child_over(&p));
            });
        }
    }

    fn child_over(core: &Arc<ActorCore>) {
        let done = {
            let mut st = core.st.lock().unwrap();
            debug_assert!(st.child_over_count > 0);
            st.child_over_count -= 1;
            st.child_over_count == 0
        };
        if done {
            Self::finish_exit(core);
        }
    }

    /// Every transitive child is gone; record the result and fire exit
    /// callbacks in registration order.
    fn finish_exit(core: &Arc<ActorCore>) {
        let (ok, callbacks, parent) = {
            let mut st = core.st.lock().unwrap();
            debug_assert!(st.lock_quit == 0, "quit-lock depth must be zero at teardown");
            let ok = !st.is_force && !st.panicked;
            st.exit_result = Some(ok);
            let callbacks = std::mem::take(&mut st.exit_callbacks);
            (ok, callbacks, st.parent.clone())
        };
        if let Some(parent) = parent.upgrade() {
            let id = core.id;
            let strand = parent.strand.clone();
            strand.post(move || {
                parent
                    .st
                    .lock()
                    .unwrap()
                    .children
                    .retain(|c| c.self_id() != id);
            });
        }
        debug!(actor = core.id, ok, "actor exited");
        for cb in callbacks {
            cb(ok);
        }
    }

    // ---------------------------------------------------------------------
    // Pause/unpause state machine

    fn enqueue_pause(core: &Arc<ActorCore>, op: PauseOp) {
        let run_now = {
            let mut st = core.st.lock().unwrap();
            if st.quited {
                let suspended = st.suspended;
                drop(st);
                match op {
                    PauseOp::Suspend(Some(cb)) | PauseOp::Resume(Some(cb)) => cb(),
                    PauseOp::Toggle(Some(cb)) => cb(suspended),
                    _ => {}
                }
                return;
            }
            st.pause_queue.push_back(op);
            st.pause_queue.len() == 1
        };
        if run_now {
            Self::process_pause(core);
        }
    }

    /// Start processing the front pause request. Requests overlap freely;
    /// the queue serializes them.
    fn process_pause(core: &Arc<ActorCore>) {
        let suspend = {
            let st = core.st.lock().unwrap();
            match st.pause_queue.front() {
                None => return,
                Some(PauseOp::Suspend(_)) => true,
                Some(PauseOp::Resume(_)) => false,
                Some(PauseOp::Toggle(_)) => !st.suspended,
            }
        };
        if suspend {
            Self::begin_suspend(core);
        } else {
            Self::begin_resume(core);
        }
    }

    fn begin_suspend(core: &Arc<ActorCore>) {
        let (timer_key, children) = {
            let mut st = core.st.lock().unwrap();
            let mut key = None;
            if !st.suspended {
                st.suspended = true;
                if let Some(slot) = st.timer.as_mut() {
                    key = slot.pause(Instant::now());
                }
            }
            st.child_pause_count = st.children.len();
            (key, st.children.clone())
        };
        if let Some(key) = timer_key {
            core.strand.executor().cancel(key);
        }
        if children.is_empty() {
            Self::pause_done(core);
            return;
        }
        for child in children {
            let parent = core.clone();
            child.notify_suspend_with(move || {
                let p = parent.clone();
                parent.strand.post(move || ActorCore::child_pause_done(&p));
            });
        }
    }

    fn begin_resume(core: &Arc<ActorCore>) {
        let (rearm, replay, children) = {
            let mut st = core.st.lock().unwrap();
            let mut rearm = None;
            let mut replay = false;
            if st.suspended {
                st.suspended = false;
                if let Some(slot) = st.timer.as_mut() {
                    rearm = slot.unpause(Instant::now());
                }
                if st.has_notify {
                    st.has_notify = false;
                    replay = true;
                }
            }
            st.child_pause_count = st.children.len();
            (rearm, replay, st.children.clone())
        };
        if let Some((generation, deadline)) = rearm {
            let c = core.clone();
            let key = core.strand.executor().schedule(
                deadline,
                Box::new(move || {
                    let c2 = c.clone();
                    c.strand
                        .post(move || ActorCore::timer_fired(&c2, generation));
                }),
            );
            let mut st = core.st.lock().unwrap();
            if let Some(slot) = st.timer.as_mut() {
                if slot.generation() == generation {
                    slot.set_key(key);
                }
            }
        }
        if replay {
            let c = core.clone();
            core.strand.post(move || ActorCore::run_one(&c));
        }
        if children.is_empty() {
            Self::pause_done(core);
            return;
        }
        for child in children {
            let parent = core.clone();
            child.notify_resume_with(move || {
                let p = parent.clone();
                parent.strand.post(move || ActorCore::child_pause_done(&p));
            });
        }
    }

    fn child_pause_done(core: &Arc<ActorCore>) {
        let done = {
            let mut st = core.st.lock().unwrap();
            if st.quited {
                return;
            }
            debug_assert!(st.child_pause_count > 0);
            st.child_pause_count -= 1;
            st.child_pause_count == 0
        };
        if done {
            Self::pause_done(core);
        }
    }

    /// The subtree has settled for the front request: complete it and move
    /// on to the next.
    fn pause_done(core: &Arc<ActorCore>) {
        let (op, paused, more) = {
            let mut st = core.st.lock().unwrap();
            let op = st.pause_queue.pop_front();
            (op, st.suspended, !st.pause_queue.is_empty())
        };
        match op {
            Some(PauseOp::Suspend(Some(cb))) | Some(PauseOp::Resume(Some(cb))) => cb(),
            Some(PauseOp::Toggle(Some(cb))) => cb(paused),
            _ => {}
        }
        if more {
            Self::process_pause(core);
        }
    }
}
