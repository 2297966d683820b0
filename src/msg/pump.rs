//! Pump/pool channel: many producers, one migratable consumer.
//!
//! The pool is the producer-side buffer and lives on its own strand; the
//! pump is the consumer endpoint and lives on its owning actor's strand.
//! The two sides are linked by a [`PumpHandler`], the pump's way of asking
//! the pool for the next message.
//!
//! Wake-up debouncing: the pool counts deliveries (`send_count`) and the
//! pump counts receipts (`pump_count`), both modulo 256. When the pump asks
//! for a message it presents its count; the pool compares: equal means
//! nothing is in flight (and an empty buffer records `waiting`), one behind
//! means a delivery is already on its way and the request is stale. The
//! counters never diverge by more than one because the pump has at most one
//! message in flight.
//!
//! A delivery that arrives after a timed read gave up is stashed in the
//! pump and handed to the next read, preserving exactly-once.

use std::sync::{Arc, Mutex};

use crate::actor::{Actor, ActorCore};
use crate::carrier::yield_once;
use crate::error::PumpDisconnected;
use crate::strand::Strand;

/// Producer-side buffer of a migratable channel. Lives on `strand`; every
/// state change happens there.
pub struct MsgPool<T: Send + 'static> {
    core: Arc<PoolCore<T>>,
}

impl<T: Send + 'static> Clone for MsgPool<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

struct PoolCore<T: Send + 'static> {
    strand: Strand,
    st: Mutex<PoolState<T>>,
}

struct PoolState<T: Send + 'static> {
    buf: std::collections::VecDeque<T>,
    pump: Option<MsgPump<T>>,
    send_count: u8,
    /// The connected pump asked for a message the buffer could not supply;
    /// the next push is delivered straight through.
    waiting: bool,
}

/// Consumer endpoint of a migratable channel.
pub struct MsgPump<T: Send + 'static> {
    core: Arc<PumpCore<T>>,
}

impl<T: Send + 'static> Clone for MsgPump<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

struct PumpCore<T: Send + 'static> {
    st: Mutex<PumpState<T>>,
}

struct PumpState<T: Send + 'static> {
    strand: Option<Strand>,
    host: Option<Actor>,
    /// Delivery that landed after a timed read gave up.
    stash: Option<T>,
    /// Delivery slot for the in-progress read.
    wait_slot: Option<T>,
    slot_armed: bool,
    waiting: bool,
    check_dis: bool,
    pump_count: u8,
    handler: Option<PumpHandler<T>>,
}

/// The pump→pool linkage: lets the pump request the next message from
/// whichever pool currently feeds it.
pub(crate) struct PumpHandler<T: Send + 'static> {
    pool: MsgPool<T>,
    pump: MsgPump<T>,
}

impl<T: Send + 'static> Clone for PumpHandler<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            pump: self.pump.clone(),
        }
    }
}

impl<T: Send + 'static> MsgPool<T> {
    pub(crate) fn new(strand: Strand, capacity: usize) -> Self {
        Self {
            core: Arc::new(PoolCore {
                strand,
                st: Mutex::new(PoolState {
                    buf: std::collections::VecDeque::with_capacity(capacity),
                    pump: None,
                    send_count: 0,
                    waiting: false,
                }),
            }),
        }
    }

    pub(crate) fn strand(&self) -> &Strand {
        &self.core.strand
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Producer entry point: enqueue or deliver `msg`. Hops to the pool
    /// strand when called from elsewhere.
    pub(crate) fn push_msg(&self, msg: T) {
        if self.core.strand.running_in_this_thread() {
            // Deliver via post so a pump on this same strand cannot re-enter
            // the producer's frame.
            self.send_msg(msg, true);
        } else {
            let pool = self.clone();
            self.core.strand.post(move || pool.send_msg(msg, false));
        }
    }

    /// On the pool strand: hand `msg` to a waiting pump or buffer it.
    fn send_msg(&self, msg: T, post_delivery: bool) {
        debug_assert!(self.core.strand.running_in_this_thread());
        let delivery = {
            let mut st = self.core.st.lock().unwrap();
            if st.waiting {
                st.waiting = false;
                debug_assert!(st.pump.is_some());
                st.send_count = st.send_count.wrapping_add(1);
                let next = if st.buf.is_empty() {
                    msg
                } else {
                    st.buf.push_back(msg);
                    st.buf.pop_front().unwrap()
                };
                st.pump.clone().map(|pump| (pump, next))
            } else {
                st.buf.push_back(msg);
                None
            }
        };
        if let Some((pump, msg)) = delivery {
            if post_delivery {
                pump.receive_msg_post(msg);
            } else {
                pump.receive_msg(msg);
            }
        }
    }

    /// On the pool strand: attach `pump` as the consumer and reset the
    /// debounce counters.
    pub(crate) fn connect_pump(&self, pump: &MsgPump<T>) -> PumpHandler<T> {
        debug_assert!(self.core.strand.running_in_this_thread());
        let mut st = self.core.st.lock().unwrap();
        st.pump = Some(pump.clone());
        st.send_count = 0;
        st.waiting = false;
        PumpHandler {
            pool: self.clone(),
            pump: pump.clone(),
        }
    }

    /// On the pool strand: detach the consumer, keeping buffered messages.
    pub(crate) fn disconnect(&self) {
        debug_assert!(self.core.strand.running_in_this_thread());
        let mut st = self.core.st.lock().unwrap();
        st.pump = None;
        st.waiting = false;
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.core.st.lock().unwrap().buf.len()
    }
}

impl<T: Send + 'static> MsgPump<T> {
    pub(crate) fn new(host: &Actor) -> Self {
        Self {
            core: Arc::new(PumpCore {
                st: Mutex::new(PumpState {
                    strand: Some(host.self_strand().clone()),
                    host: Some(host.clone()),
                    stash: None,
                    wait_slot: None,
                    slot_armed: false,
                    waiting: false,
                    check_dis: false,
                    pump_count: 0,
                    handler: None,
                }),
            }),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn strand(&self) -> Option<Strand> {
        self.core.st.lock().unwrap().strand.clone()
    }

    pub(crate) fn host_id(&self) -> Option<u64> {
        self.core
            .st
            .lock()
            .unwrap()
            .host
            .as_ref()
            .map(|h| h.self_id())
    }

    /// True when no handler is bound: the pump was delegated away or never
    /// connected.
    pub fn is_disconnected(&self) -> bool {
        self.core.st.lock().unwrap().handler.is_none()
    }

    /// Deliver onto the pump strand, inline when already there.
    pub(crate) fn receive_msg(&self, msg: T) {
        let Some(strand) = self.strand() else { return };
        if strand.running_in_this_thread() {
            self.receiver(msg);
        } else {
            let pump = self.clone();
            strand.post(move || pump.receiver(msg));
        }
    }

    /// Deliver via the strand queue even when already on the pump strand.
    pub(crate) fn receive_msg_post(&self, msg: T) {
        let Some(strand) = self.strand() else { return };
        let pump = self.clone();
        strand.post(move || pump.receiver(msg));
    }

    /// On the pump strand: complete the in-progress read, or stash a late
    /// delivery.
    fn receiver(&self, msg: T) {
        let resume = {
            let mut st = self.core.st.lock().unwrap();
            let Some(host) = st.host.clone() else { return };
            if host.is_quited() {
                return;
            }
            debug_assert!(st.stash.is_none(), "more than one message in flight");
            st.pump_count = st.pump_count.wrapping_add(1);
            if st.slot_armed {
                st.wait_slot = Some(msg);
                st.slot_armed = false;
                if st.waiting {
                    st.waiting = false;
                    st.check_dis = false;
                    Some(host)
                } else {
                    // Read in progress on this strand; it sees the slot.
                    None
                }
            } else {
                debug_assert!(!st.waiting);
                st.stash = Some(msg);
                None
            }
        };
        if let Some(host) = resume {
            ActorCore::run_one(host.core());
        }
    }

    /// On the pump strand: try to take a message without yielding. Leaves
    /// `waiting` set when empty, so a later delivery resumes the reader.
    fn read_msg(&self) -> Option<T> {
        let (handler, pump_count) = {
            let mut st = self.core.st.lock().unwrap();
            debug_assert!(!st.slot_armed && !st.waiting, "second reader on a pump");
            if let Some(msg) = st.stash.take() {
                return Some(msg);
            }
            st.slot_armed = true;
            (st.handler.clone(), st.pump_count)
        };
        match handler {
            Some(handler) => {
                // May deliver inline when the pool shares this strand.
                handler.call(pump_count);
                let mut st = self.core.st.lock().unwrap();
                if !st.slot_armed {
                    let msg = st.wait_slot.take();
                    debug_assert!(msg.is_some());
                    return msg;
                }
                st.waiting = true;
                None
            }
            None => {
                let mut st = self.core.st.lock().unwrap();
                st.waiting = true;
                None
            }
        }
    }

    /// On the pump strand: bind to a (re)connected pool.
    pub(crate) fn connect(&self, handler: PumpHandler<T>) {
        let post = {
            let mut st = self.core.st.lock().unwrap();
            match &st.host {
                Some(host) if !host.is_quited() => {
                    st.pump_count = 0;
                    st.handler = Some(handler.clone());
                    st.waiting
                }
                _ => false,
            }
        };
        if post {
            handler.post_pump(0);
        }
    }

    /// On the pump strand: drop the pool linkage. A reader that opted into
    /// the disconnect check is resumed to observe it.
    pub(crate) fn clear_link(&self) {
        let resume = {
            let mut st = self.core.st.lock().unwrap();
            st.handler = None;
            if st.check_dis {
                debug_assert!(st.waiting);
                st.waiting = false;
                st.slot_armed = false;
                st.host.clone()
            } else {
                None
            }
        };
        if let Some(host) = resume {
            ActorCore::run_one(host.core());
        }
    }

    /// Full reset; the pump no longer belongs to any actor.
    pub(crate) fn close(&self) {
        let mut st = self.core.st.lock().unwrap();
        st.stash = None;
        st.wait_slot = None;
        st.slot_armed = false;
        st.waiting = false;
        st.check_dis = false;
        st.pump_count = 0;
        st.handler = None;
        st.host = None;
        st.strand = None;
    }
}

impl<T: Send + 'static> PumpHandler<T> {
    /// The pump requests the next message, presenting its receipt count.
    /// Runs inline on the pool strand, hops otherwise.
    pub(crate) fn call(&self, pump_id: u8) {
        if !self.pool.core.strand.running_in_this_thread() {
            let this = self.clone();
            self.pool
                .core
                .strand
                .post(move || this.call(pump_id));
            return;
        }
        let delivery = {
            let mut st = self.pool.core.st.lock().unwrap();
            let connected = st
                .pump
                .as_ref()
                .map(|p| p.ptr_eq(&self.pump))
                .unwrap_or(false);
            if !connected {
                None
            } else if pump_id == st.send_count {
                match st.buf.pop_front() {
                    Some(msg) => {
                        st.send_count = st.send_count.wrapping_add(1);
                        Some(msg)
                    }
                    None => {
                        st.waiting = true;
                        None
                    }
                }
            } else {
                // The previous delivery is still in flight; the counters may
                // only ever differ by one.
                debug_assert!(pump_id.wrapping_add(1) == st.send_count);
                debug_assert!(!st.waiting);
                None
            }
        };
        if let Some(msg) = delivery {
            self.pump.receive_msg(msg);
        }
    }

    /// Like [`call`](Self::call), but always through the pool strand queue.
    pub(crate) fn post_pump(&self, pump_id: u8) {
        let this = self.clone();
        self.pool
            .core
            .strand
            .post(move || this.call(pump_id));
    }
}

impl Actor {
    /// Take the next pumped message, yielding up to `ms` milliseconds
    /// (negative means no limit). `Ok(None)` on timeout. With
    /// `check_disconnect`, a pump with no bound handler fails with
    /// [`PumpDisconnected`] instead of waiting forever.
    pub async fn timed_pump_msg<T: Send + 'static>(
        &self,
        ms: i64,
        pump: &MsgPump<T>,
        check_disconnect: bool,
    ) -> Result<Option<T>, PumpDisconnected> {
        self.assert_enter();
        debug_assert!(
            pump.host_id() == Some(self.self_id()),
            "pump read from a non-host actor"
        );
        if let Some(msg) = pump.read_msg() {
            return Ok(Some(msg));
        }
        // read_msg left the reader registered (slot armed / waiting).
        if check_disconnect && pump.is_disconnected() {
            let mut st = pump.core.st.lock().unwrap();
            st.waiting = false;
            st.slot_armed = false;
            return Err(PumpDisconnected);
        }
        {
            let mut st = pump.core.st.lock().unwrap();
            st.check_dis = check_disconnect;
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
        let cell = pump.core.clone();
        let mut cleanup = Cleanup {
            cell: Some(cell),
            done: false,
        };
        yield_once().await;
        cleanup.done = true;

        let mut st = pump.core.st.lock().unwrap();
        if let Some(msg) = st.wait_slot.take() {
            drop(st);
            if timed {
                self.cancel_delay_trig();
            }
            return Ok(Some(msg));
        }
        if st.waiting {
            // Timer wake with nothing delivered.
            debug_assert!(timed);
            st.waiting = false;
            st.slot_armed = false;
            st.check_dis = false;
            return Ok(None);
        }
        // Resumed by clear_link: the linkage is gone.
        debug_assert!(st.check_dis);
        st.check_dis = false;
        drop(st);
        if timed {
            self.cancel_delay_trig();
        }
        Err(PumpDisconnected)
    }

    /// Take the next pumped message, yielding indefinitely.
    pub async fn pump_msg<T: Send + 'static>(
        &self,
        pump: &MsgPump<T>,
        check_disconnect: bool,
    ) -> Result<T, PumpDisconnected> {
        match self.timed_pump_msg(-1, pump, check_disconnect).await? {
            Some(msg) => Ok(msg),
            None => unreachable!("untimed pump wait cannot time out"),
        }
    }
}

/// Restores pump reader invariants if the wait is cancelled at its yield
/// point. A message already delivered into the wait slot moves to the stash
/// so it is not lost.
struct Cleanup<T: Send + 'static> {
    cell: Option<Arc<PumpCore<T>>>,
    done: bool,
}

impl<T: Send + 'static> Drop for Cleanup<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(cell) = self.cell.take() {
            let mut st = cell.st.lock().unwrap();
            st.waiting = false;
            st.slot_armed = false;
            st.check_dis = false;
            if let Some(msg) = st.wait_slot.take() {
                debug_assert!(st.stash.is_none());
                st.stash = Some(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use std::time::Duration;

    #[test]
    fn pool_buffers_while_no_pump_is_connected() {
        let exec = Executor::new();
        exec.open(1);
        let pool: MsgPool<u32> = MsgPool::new(exec.make_strand(), 8);
        pool.push_msg(1);
        pool.push_msg(2);
        pool.push_msg(3);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.buffered(), 3);
        exec.close();
    }
}
