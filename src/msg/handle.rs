//! Mailbox and trigger: the two handle-owned channel shapes.
//!
//! A handle lives in its consuming actor's body; notifiers made from it can
//! be cloned and sent anywhere. Deliveries post onto the host actor's
//! strand and are dropped once the host has quit or the handle was closed.
//! At most one wait may be outstanding per handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::actor::{Actor, ActorCore};
use crate::carrier::yield_once;
use crate::strand::Strand;

/// Default mailbox preallocation.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Mailbox

/// Multi-message FIFO owned by one consuming actor.
pub struct MsgHandle<T: Send + 'static> {
    cell: Arc<MsgCell<T>>,
}

struct MsgCell<T> {
    st: Mutex<MsgState<T>>,
}

struct MsgState<T> {
    queue: VecDeque<T>,
    capacity: usize,
    waiting: bool,
    wait_slot: Option<T>,
    closed: bool,
    /// Bumped by `close` and by each re-issue of notifiers; stale
    /// notifiers carry an old epoch and are ignored.
    epoch: u64,
    host: Option<Actor>,
}

impl<T: Send + 'static> MsgHandle<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    /// `capacity` sizes the FIFO's preallocation; production beyond it
    /// falls back to the allocator.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cell: Arc::new(MsgCell {
                st: Mutex::new(MsgState {
                    queue: VecDeque::with_capacity(capacity),
                    capacity,
                    waiting: false,
                    wait_slot: None,
                    closed: true,
                    epoch: 0,
                    host: None,
                }),
            }),
        }
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        self.cell.st.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell.st.lock().unwrap().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cell.st.lock().unwrap().capacity
    }

    /// Invalidate all notifiers and drop buffered messages.
    pub fn close(&self) {
        let mut st = self.cell.st.lock().unwrap();
        debug_assert!(!st.waiting, "mailbox closed while a wait is outstanding");
        st.closed = true;
        st.epoch += 1;
        st.queue.clear();
        st.wait_slot = None;
    }
}

impl<T: Send + 'static> Default for MsgHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable producer handle for a [`MsgHandle`].
pub struct MsgNotifier<T: Send + 'static> {
    cell: Arc<MsgCell<T>>,
    strand: Strand,
    epoch: u64,
}

impl<T: Send + 'static> Clone for MsgNotifier<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            strand: self.strand.clone(),
            epoch: self.epoch,
        }
    }
}

impl<T: Send + 'static> MsgNotifier<T> {
    /// Post `msg` to the host actor's mailbox. Callable from any thread.
    /// The message is dropped if the host has quit or the handle closed.
    pub fn send(&self, msg: T) {
        let cell = self.cell.clone();
        let epoch = self.epoch;
        self.strand.post(move || deliver_msg(&cell, epoch, msg));
    }
}

/// Mailbox delivery on the host strand.
fn deliver_msg<T: Send + 'static>(cell: &Arc<MsgCell<T>>, epoch: u64, msg: T) {
    let mut st = cell.st.lock().unwrap();
    if st.epoch != epoch || st.closed {
        return;
    }
    let Some(host) = st.host.clone() else { return };
    if host.is_quited() {
        return;
    }
    if st.waiting {
        debug_assert!(st.wait_slot.is_none());
        st.wait_slot = Some(msg);
        st.waiting = false;
        drop(st);
        ActorCore::run_one(host.core());
    } else {
        st.queue.push_back(msg);
    }
}

// ---------------------------------------------------------------------------
// Trigger

/// Single-shot slot: the first delivery closes it permanently.
pub struct TrigHandle<T: Send + 'static> {
    cell: Arc<TrigCell<T>>,
}

struct TrigCell<T> {
    st: Mutex<TrigState<T>>,
}

struct TrigState<T> {
    value: Option<T>,
    fired: bool,
    waiting: bool,
    wait_slot: Option<T>,
    epoch: u64,
    host: Option<Actor>,
}

impl<T: Send + 'static> TrigHandle<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(TrigCell {
                st: Mutex::new(TrigState {
                    value: None,
                    fired: false,
                    waiting: false,
                    wait_slot: None,
                    epoch: 0,
                    host: None,
                }),
            }),
        }
    }

    /// True once a delivery has happened; further pushes are dropped.
    pub fn is_closed(&self) -> bool {
        self.cell.st.lock().unwrap().fired
    }

    pub fn close(&self) {
        let mut st = self.cell.st.lock().unwrap();
        debug_assert!(!st.waiting, "trigger closed while a wait is outstanding");
        st.fired = true;
        st.epoch += 1;
        st.value = None;
        st.wait_slot = None;
    }
}

impl<T: Send + 'static> Default for TrigHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable producer handle for a [`TrigHandle`]. All clones share the one
/// shot: firing twice (from any clone) is a usage error and a no-op.
pub struct TrigNotifier<T: Send + 'static> {
    cell: Arc<TrigCell<T>>,
    strand: Strand,
    epoch: u64,
    used: Arc<AtomicBool>,
}

impl<T: Send + 'static> Clone for TrigNotifier<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            strand: self.strand.clone(),
            epoch: self.epoch,
            used: self.used.clone(),
        }
    }
}

impl<T: Send + 'static> TrigNotifier<T> {
    /// Deliver the single shot. Callable from any thread.
    pub fn fire(&self, msg: T) {
        if self.used.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "trigger notifier fired twice");
            return;
        }
        let cell = self.cell.clone();
        let epoch = self.epoch;
        self.strand.post(move || deliver_trig(&cell, epoch, msg));
    }
}

fn deliver_trig<T: Send + 'static>(cell: &Arc<TrigCell<T>>, epoch: u64, msg: T) {
    let mut st = cell.st.lock().unwrap();
    if st.epoch != epoch || st.fired {
        return;
    }
    st.fired = true;
    let Some(host) = st.host.clone() else { return };
    if host.is_quited() {
        return;
    }
    if st.waiting {
        debug_assert!(st.wait_slot.is_none());
        st.wait_slot = Some(msg);
        st.waiting = false;
        drop(st);
        ActorCore::run_one(host.core());
    } else {
        st.value = Some(msg);
    }
}

// ---------------------------------------------------------------------------
// Wait plumbing

/// Restores the single-waiter invariant if the wait is cancelled at its
/// yield point (actor force-quit while blocked).
struct WaitCleanup<F: FnMut()> {
    disarm: F,
    done: bool,
}

impl<F: FnMut()> WaitCleanup<F> {
    fn new(disarm: F) -> Self {
        Self {
            disarm,
            done: false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
    }
}

impl<F: FnMut()> Drop for WaitCleanup<F> {
    fn drop(&mut self) {
        if !self.done {
            (self.disarm)();
        }
    }
}

impl Actor {
    // -----------------------------------------------------------------
    // Mailbox API

    /// Bind `handle` to this actor and mint a producer for it. Re-issuing
    /// invalidates previously minted notifiers.
    pub fn make_msg_notifier<T: Send + 'static>(&self, handle: &MsgHandle<T>) -> MsgNotifier<T> {
        self.assert_enter();
        let mut st = handle.cell.st.lock().unwrap();
        debug_assert!(!st.waiting, "rebinding a mailbox with a wait outstanding");
        st.host = Some(self.clone());
        st.closed = false;
        st.epoch += 1;
        MsgNotifier {
            cell: handle.cell.clone(),
            strand: self.self_strand().clone(),
            epoch: st.epoch,
        }
    }

    /// Take the next message, yielding up to `ms` milliseconds (negative
    /// means no limit). `None` on timeout.
    pub async fn timed_wait_msg<T: Send + 'static>(
        &self,
        ms: i64,
        handle: &MsgHandle<T>,
    ) -> Option<T> {
        self.assert_enter();
        {
            let mut st = handle.cell.st.lock().unwrap();
            debug_assert!(
                st.host.as_ref().map(|h| h.self_id()) == Some(self.self_id()),
                "mailbox wait from a non-host actor"
            );
            debug_assert!(!st.closed, "wait on a closed mailbox");
            if let Some(msg) = st.queue.pop_front() {
                return Some(msg);
            }
            debug_assert!(!st.waiting, "second waiter on a mailbox");
            st.waiting = true;
        }
        let timed = ms >= 0;
        if timed {
            let core = self.core().clone();
            ActorCore::delay_arm(
                self.core(),
                std::time::Duration::from_millis(ms as u64),
                Box::new(move || ActorCore::run_one(&core)),
            );
        }
        let cell = handle.cell.clone();
        let mut cleanup = WaitCleanup::new(move || {
            let mut st = cell.st.lock().unwrap();
            st.waiting = false;
            st.wait_slot = None;
        });
        yield_once().await;
        cleanup.finish();

        let mut st = handle.cell.st.lock().unwrap();
        match st.wait_slot.take() {
            Some(msg) => {
                drop(st);
                if timed {
                    self.cancel_delay_trig();
                }
                Some(msg)
            }
            None => {
                // Timer wake: nothing was delivered.
                debug_assert!(timed);
                st.waiting = false;
                None
            }
        }
    }

    /// Take the next message, yielding indefinitely.
    pub async fn wait_msg<T: Send + 'static>(&self, handle: &MsgHandle<T>) -> T {
        match self.timed_wait_msg(-1, handle).await {
            Some(msg) => msg,
            None => unreachable!("untimed mailbox wait cannot time out"),
        }
    }

    // -----------------------------------------------------------------
    // Trigger API

    /// Bind `handle` to this actor and mint its single-shot producer.
    /// Re-issuing re-opens the slot and invalidates old notifiers.
    pub fn make_trig_notifier<T: Send + 'static>(&self, handle: &TrigHandle<T>) -> TrigNotifier<T> {
        self.assert_enter();
        let mut st = handle.cell.st.lock().unwrap();
        debug_assert!(!st.waiting, "rebinding a trigger with a wait outstanding");
        st.host = Some(self.clone());
        st.fired = false;
        st.value = None;
        st.wait_slot = None;
        st.epoch += 1;
        TrigNotifier {
            cell: handle.cell.clone(),
            strand: self.self_strand().clone(),
            epoch: st.epoch,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the trigger's single delivery, yielding up to `ms` milliseconds
    /// (negative means no limit). `None` on timeout or if the delivery was
    /// already consumed.
    pub async fn timed_wait_trig<T: Send + 'static>(
        &self,
        ms: i64,
        handle: &TrigHandle<T>,
    ) -> Option<T> {
        self.assert_enter();
        {
            let mut st = handle.cell.st.lock().unwrap();
            debug_assert!(
                st.host.as_ref().map(|h| h.self_id()) == Some(self.self_id()),
                "trigger wait from a non-host actor"
            );
            if let Some(value) = st.value.take() {
                return Some(value);
            }
            if st.fired {
                // Already delivered and consumed; nothing more will come.
                return None;
            }
            debug_assert!(!st.waiting, "second waiter on a trigger");
            st.waiting = true;
        }
        let timed = ms >= 0;
        if timed {
            let core = self.core().clone();
            ActorCore::delay_arm(
                self.core(),
                std::time::Duration::from_millis(ms as u64),
                Box::new(move || ActorCore::run_one(&core)),
            );
        }
        let cell = handle.cell.clone();
        let mut cleanup = WaitCleanup::new(move || {
            let mut st = cell.st.lock().unwrap();
            st.waiting = false;
            st.wait_slot = None;
        });
        yield_once().await;
        cleanup.finish();

        let mut st = handle.cell.st.lock().unwrap();
        match st.wait_slot.take() {
            Some(value) => {
                drop(st);
                if timed {
                    self.cancel_delay_trig();
                }
                Some(value)
            }
            None => {
                debug_assert!(timed);
                st.waiting = false;
                None
            }
        }
    }

    /// Take the trigger's single delivery, yielding indefinitely.
    pub async fn wait_trig<T: Send + 'static>(&self, handle: &TrigHandle<T>) -> T {
        match self.timed_wait_trig(-1, handle).await {
            Some(value) => value,
            // The untimed wait cannot time out, so `None` means the single
            // delivery was consumed earlier.
            None => panic!("untimed wait on an already-consumed trigger"),
        }
    }

    /// Deliver `value` into `handle` after `ms` milliseconds through this
    /// actor's delay slot.
    pub fn delay_push_trig<T: Send + 'static>(&self, ms: i64, handle: &TrigHandle<T>, value: T) {
        self.assert_enter();
        let st = handle.cell.st.lock().unwrap();
        debug_assert!(
            st.host.as_ref().map(|h| h.self_id()) == Some(self.self_id()),
            "delayed trigger for a non-host actor"
        );
        debug_assert!(!st.fired, "delayed trigger on a closed handle");
        let epoch = st.epoch;
        drop(st);
        let cell = handle.cell.clone();
        self.delay_trig(ms, move || deliver_trig(&cell, epoch, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_buffers_until_close() {
        let handle: MsgHandle<u32> = MsgHandle::with_capacity(4);
        assert!(handle.is_empty());
        assert_eq!(handle.capacity(), 4);
        handle.cell.st.lock().unwrap().queue.push_back(7);
        assert_eq!(handle.len(), 1);
        handle.close();
        assert!(handle.is_empty());
    }

    #[test]
    fn trigger_reports_closed_after_delivery() {
        let handle: TrigHandle<u32> = TrigHandle::new();
        assert!(!handle.is_closed());
        {
            let mut st = handle.cell.st.lock().unwrap();
            st.fired = true;
            st.value = Some(3);
        }
        assert!(handle.is_closed());
    }
}
