//! Per-type message packets and the delegation chain.
//!
//! Every actor owns one *packet* per message type it has touched: the
//! packet bundles the type's pool, pump, a link to the next packet in the
//! delegation chain, and the actor mutex that serializes chain surgery.
//! `msg_agent_to` re-links an actor's packet to a child's, migrating the
//! pool to the chain's tail so producers keep a stable target while the
//! consumer moves. Chain mutexes are always taken root-to-leaf; dispatch
//! paths never touch them because they run strand-confined.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::actor::supervision::ChildHandle;
use crate::actor::{Actor, ActorCore, SpawnOptions};
use crate::msg::handle::DEFAULT_MAILBOX_CAPACITY;
use crate::msg::pump::{MsgPool, MsgPump};
use crate::sync::ActorMutex;

/// Clonable producer handle bound to a pool. The pool outlives consumer
/// migrations, so a notifier stays valid across delegation.
pub struct PoolNotifier<T: Send + 'static> {
    pool: MsgPool<T>,
}

impl<T: Send + 'static> Clone for PoolNotifier<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<T: Send + 'static> PoolNotifier<T> {
    fn new(pool: MsgPool<T>) -> Self {
        Self { pool }
    }

    /// Post `msg` toward whichever pump currently consumes this type.
    /// Callable from any thread.
    pub fn send(&self, msg: T) {
        self.pool.push_msg(msg);
    }
}

/// One per (actor, message type): the unit the delegation chain links.
pub(crate) struct Pck<T: Send + 'static> {
    mutex: ActorMutex,
    st: Mutex<PckState<T>>,
}

struct PckState<T: Send + 'static> {
    /// True exactly at the packet currently heading its type's chain.
    is_head: bool,
    pool: Option<MsgPool<T>>,
    pump: Option<MsgPump<T>>,
    next: Option<Arc<Pck<T>>>,
}

/// Type-erased packet registry stored in the actor's shared state.
pub(crate) struct MsgSlots {
    entries: HashMap<TypeId, SlotEntry>,
}

struct SlotEntry {
    pck: Arc<dyn Any + Send + Sync>,
    close: Box<dyn Fn() + Send>,
}

impl MsgSlots {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Taken at teardown; each closer detaches the packet's pump from the
    /// dying actor.
    pub(crate) fn take_closers(&mut self) -> Vec<Box<dyn Fn() + Send>> {
        self.entries.drain().map(|(_, entry)| entry.close).collect()
    }

    fn get<T: Send + 'static>(&self) -> Option<Arc<Pck<T>>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.pck.clone().downcast::<Pck<T>>().ok())
    }

    fn insert<T: Send + 'static>(&mut self, pck: Arc<Pck<T>>) {
        let closer = pck.clone();
        self.entries.insert(
            TypeId::of::<T>(),
            SlotEntry {
                pck,
                close: Box::new(move || {
                    let pump = closer.st.lock().unwrap().pump.clone();
                    if let Some(pump) = pump {
                        pump.close();
                    }
                }),
            },
        );
    }
}

/// Fetch (or create) an actor's packet for `T`. Must run on that actor's
/// strand.
fn pck_for<T: Send + 'static>(core: &Arc<ActorCore>, make: bool) -> Option<Arc<Pck<T>>> {
    debug_assert!(core.strand().running_in_this_thread());
    core.with_shared(|st| {
        if let Some(pck) = st.slots.get::<T>() {
            return Some(pck);
        }
        if !make {
            return None;
        }
        let pck = Arc::new(Pck {
            mutex: ActorMutex::new(),
            st: Mutex::new(PckState {
                is_head: true,
                pool: None,
                pump: None,
                next: None,
            }),
        });
        st.slots.insert(pck.clone());
        Some(pck)
    })
}

impl Actor {
    /// Lock every packet from `node` (already locked by the caller) toward
    /// the tail; returns the locked tail-ward nodes in order.
    async fn lock_tailward<T: Send + 'static>(&self, node: &Arc<Pck<T>>) -> Vec<Arc<Pck<T>>> {
        let mut locked = Vec::new();
        let mut cur = node.clone();
        loop {
            let next = cur.st.lock().unwrap().next.clone();
            match next {
                Some(n) => {
                    n.mutex.lock(self).await;
                    locked.push(n.clone());
                    cur = n;
                }
                None => break,
            }
        }
        locked
    }

    /// Tear down the sub-chain from `node` (locked by the caller): detach
    /// the tail's pool and pump, and drop every node's pool reference.
    async fn clear_chain<T: Send + 'static>(&self, node: &Arc<Pck<T>>) {
        self.check_stack();
        let locked = self.lock_tailward(node).await;
        let tail = locked.last().cloned().unwrap_or_else(|| node.clone());
        let (pool, pump) = {
            let st = tail.st.lock().unwrap();
            (st.pool.clone(), st.pump.clone())
        };
        if let Some(pool) = pool {
            let p = pool.clone();
            self.send(pool.strand(), move || p.disconnect()).await;
        }
        if let Some(pump) = pump {
            if let Some(strand) = pump.strand() {
                let p = pump.clone();
                self.send(&strand, move || p.clear_link()).await;
            }
        }
        node.st.lock().unwrap().pool = None;
        for n in &locked {
            n.st.lock().unwrap().pool = None;
        }
        for n in locked.iter().rev() {
            n.mutex.unlock(self);
        }
    }

    /// Re-host `new_pool` at the tail of the chain starting at `node`
    /// (locked by the caller): the tail pump reconnects to it, every node
    /// records it, intermediate pumps are already detached.
    async fn update_chain<T: Send + 'static>(&self, node: &Arc<Pck<T>>, new_pool: Option<MsgPool<T>>) {
        self.check_stack();
        let locked = self.lock_tailward(node).await;
        let tail = locked.last().cloned().unwrap_or_else(|| node.clone());
        let (old_pool, pump) = {
            let st = tail.st.lock().unwrap();
            (st.pool.clone(), st.pump.clone())
        };
        if let Some(old) = old_pool {
            let p = old.clone();
            self.send(old.strand(), move || p.disconnect()).await;
        }
        if let Some(pump) = pump {
            match new_pool.clone() {
                Some(pool) => {
                    let pool2 = pool.clone();
                    let pump2 = pump.clone();
                    let handler = self
                        .send(pool.strand(), move || pool2.connect_pump(&pump2))
                        .await;
                    if let Some(strand) = pump.strand() {
                        let pump3 = pump.clone();
                        self.send(&strand, move || pump3.connect(handler)).await;
                    }
                }
                None => {
                    if let Some(strand) = pump.strand() {
                        let p = pump.clone();
                        self.send(&strand, move || p.clear_link()).await;
                    }
                }
            }
        }
        node.st.lock().unwrap().pool = new_pool.clone();
        for n in &locked {
            n.st.lock().unwrap().pool = new_pool.clone();
        }
        for n in locked.iter().rev() {
            n.mutex.unlock(self);
        }
    }

    /// Delegate this actor's `T` messages to a child: the child's packet
    /// becomes the chain tail and the current pool migrates to it. Any
    /// previous delegation sub-chain is cleared first.
    pub async fn msg_agent_to<T: Send + 'static>(&self, child: &ChildHandle) {
        self.delegate_to::<T>(child.actor().clone()).await;
    }

    pub(crate) async fn delegate_to<T: Send + 'static>(&self, child: Actor) {
        self.assert_enter();
        debug_assert!(
            child.parent_actor().map(|p| p.self_id()) == Some(self.self_id()),
            "message delegation target must be a child of this actor"
        );
        let pck = match pck_for::<T>(self.core(), true) {
            Some(pck) => pck,
            None => return,
        };
        let _guard = self.quit_guard();
        pck.mutex.lock(self).await;
        let next = pck.st.lock().unwrap().next.clone();
        if let Some(next) = next {
            next.mutex.lock(self).await;
            self.clear_chain(&next).await;
            next.mutex.unlock(self);
        }
        let child_core = child.core().clone();
        let child_pck = self
            .send(child.self_strand(), move || {
                pck_for::<T>(&child_core, true).expect("packet creation is infallible")
            })
            .await;
        pck.st.lock().unwrap().next = Some(child_pck.clone());
        child_pck.mutex.lock(self).await;
        child_pck.st.lock().unwrap().is_head = false;
        let pool = pck.st.lock().unwrap().pool.clone();
        self.update_chain(&child_pck, pool).await;
        child_pck.mutex.unlock(self);
        pck.mutex.unlock(self);
        debug!(actor = self.self_id(), child = child.self_id(), "messages delegated");
    }

    /// Undo a delegation: clear the sub-chain, promote the former delegate
    /// to a chain head of its own, and keep buffered messages intact.
    pub async fn msg_agent_off<T: Send + 'static>(&self) {
        self.assert_enter();
        let Some(pck) = pck_for::<T>(self.core(), false) else {
            return;
        };
        let _guard = self.quit_guard();
        pck.mutex.lock(self).await;
        let next = pck.st.lock().unwrap().next.clone();
        if let Some(next) = next {
            next.mutex.lock(self).await;
            self.clear_chain(&next).await;
            next.st.lock().unwrap().is_head = true;
            next.mutex.unlock(self);
            pck.st.lock().unwrap().next = None;
        }
        pck.mutex.unlock(self);
    }

    /// Spawn a child dedicated to consuming this actor's `T` messages: the
    /// child connects a pump and runs `agent_body` with it.
    pub async fn msg_agent_to_actor<T, F, Fut>(
        &self,
        auto_run: bool,
        options: SpawnOptions,
        agent_body: F,
    ) -> ChildHandle
    where
        T: Send + 'static,
        F: FnOnce(Actor, MsgPump<T>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.assert_enter();
        let mut handle =
            self.create_child_actor_on(self.self_strand().clone(), options, move |child| async move {
                let pump = child.connect_msg_pump::<T>().await;
                agent_body(child.clone(), pump).await;
            });
        self.delegate_to::<T>(handle.actor().clone()).await;
        if auto_run {
            self.child_actor_run(&mut handle);
        }
        handle
    }

    /// Bind (or rebind) this actor's pump for `T` to whichever pool the
    /// packet currently has, clearing any delegation. The returned pump is
    /// the canonical consumer for the type.
    pub async fn connect_msg_pump<T: Send + 'static>(&self) -> MsgPump<T> {
        self.assert_enter();
        let pck = pck_for::<T>(self.core(), true).expect("packet creation is infallible");
        let _guard = self.quit_guard();
        pck.mutex.lock(self).await;
        let next = pck.st.lock().unwrap().next.clone();
        if let Some(next) = next {
            next.mutex.lock(self).await;
            self.clear_chain(&next).await;
            next.mutex.unlock(self);
            pck.st.lock().unwrap().next = None;
        }
        let (pump, pool) = {
            let mut st = pck.st.lock().unwrap();
            if st.pump.is_none() {
                st.pump = Some(MsgPump::new(self));
            }
            (st.pump.clone().unwrap(), st.pool.clone())
        };
        match pool {
            Some(pool) => {
                let pool2 = pool.clone();
                let pump2 = pump.clone();
                let handler = self
                    .send(pool.strand(), move || pool2.connect_pump(&pump2))
                    .await;
                pump.connect(handler);
            }
            None => pump.clear_link(),
        }
        pck.mutex.unlock(self);
        pump
    }

    /// Mint a producer whose messages land with `buddy`: a child of this
    /// actor, or a parentless peer. With `make_new`, a fresh pool replaces
    /// whatever fed the buddy before (ending a delegation from this actor,
    /// if that is what it was). Without it, the buddy must head its own
    /// chain; its existing pool is reused (or created). Returns `None` when
    /// the buddy is delegated and cannot accept producers.
    pub async fn connect_msg_notifier_to<T: Send + 'static>(
        &self,
        buddy: &Actor,
        make_new: bool,
        capacity: usize,
    ) -> Option<PoolNotifier<T>> {
        self.assert_enter();
        let related = match buddy.parent_actor() {
            None => true,
            Some(parent) => parent.self_id() == self.self_id(),
        };
        if !related {
            debug_assert!(false, "notifier target must be a child or a parentless peer");
            return None;
        }
        let pck = pck_for::<T>(self.core(), true).expect("packet creation is infallible");
        let _guard = self.quit_guard();
        pck.mutex.lock(self).await;
        let buddy_core = buddy.core().clone();
        let buddy_pck = self
            .send(buddy.self_strand(), move || {
                pck_for::<T>(&buddy_core, true).expect("packet creation is infallible")
            })
            .await;

        if make_new {
            let new_pool = MsgPool::new(buddy.self_strand().clone(), capacity);
            buddy_pck.mutex.lock(self).await;
            buddy_pck.st.lock().unwrap().is_head = true;
            self.update_chain(&buddy_pck, Some(new_pool.clone())).await;
            buddy_pck.mutex.unlock(self);
            let was_delegate = pck
                .st
                .lock()
                .unwrap()
                .next
                .as_ref()
                .map(|n| Arc::ptr_eq(n, &buddy_pck))
                .unwrap_or(false);
            if was_delegate {
                pck.st.lock().unwrap().next = None;
                let (pump, pool) = {
                    let st = pck.st.lock().unwrap();
                    (st.pump.clone(), st.pool.clone())
                };
                if let Some(pump) = pump {
                    match pool {
                        Some(pool) => {
                            let pool2 = pool.clone();
                            let pump2 = pump.clone();
                            let handler = self
                                .send(pool.strand(), move || pool2.connect_pump(&pump2))
                                .await;
                            pump.connect(handler);
                        }
                        None => pump.clear_link(),
                    }
                }
            }
            pck.mutex.unlock(self);
            return Some(PoolNotifier::new(new_pool));
        }

        buddy_pck.mutex.lock(self).await;
        let is_head = buddy_pck.st.lock().unwrap().is_head;
        let result = if is_head {
            debug_assert!(pck
                .st
                .lock()
                .unwrap()
                .next
                .as_ref()
                .map(|n| !Arc::ptr_eq(n, &buddy_pck))
                .unwrap_or(true));
            let existing = buddy_pck.st.lock().unwrap().pool.clone();
            let pool = match existing {
                Some(pool) => pool,
                None => MsgPool::new(buddy.self_strand().clone(), capacity),
            };
            self.update_chain(&buddy_pck, Some(pool.clone())).await;
            Some(PoolNotifier::new(pool))
        } else {
            None
        };
        buddy_pck.mutex.unlock(self);
        pck.mutex.unlock(self);
        result
    }

    /// [`connect_msg_notifier_to`](Self::connect_msg_notifier_to) aimed at
    /// this actor itself. Fails (returns `None`) when this actor's packet
    /// is itself a delegate of its parent.
    pub async fn connect_msg_notifier_to_self<T: Send + 'static>(
        &self,
        make_new: bool,
        capacity: usize,
    ) -> Option<PoolNotifier<T>> {
        self.assert_enter();
        let pck = pck_for::<T>(self.core(), true).expect("packet creation is infallible");
        let _guard = self.quit_guard();
        pck.mutex.lock(self).await;
        let result = if pck.st.lock().unwrap().is_head {
            let existing = pck.st.lock().unwrap().pool.clone();
            let pool = match (make_new, existing) {
                (false, Some(pool)) => pool,
                _ => MsgPool::new(self.self_strand().clone(), capacity),
            };
            self.update_chain(&pck, Some(pool.clone())).await;
            Some(PoolNotifier::new(pool))
        } else {
            None
        };
        pck.mutex.unlock(self);
        result
    }

    /// Pre-run producer setup, callable from outside the pool: only legal
    /// for a parentless actor that has not started yet.
    pub fn connect_msg_notifier<T: Send + 'static>(&self, capacity: usize) -> Option<PoolNotifier<T>> {
        let core = self.core().clone();
        let strand = self.self_strand().clone();
        let pool_strand = strand.clone();
        strand.sync_invoke(move || {
            if core.has_parent() || core.started() {
                debug_assert!(false, "connect_msg_notifier requires a parentless, unstarted actor");
                return None;
            }
            let pck = pck_for::<T>(&core, true).expect("packet creation is infallible");
            let pool = MsgPool::new(pool_strand, capacity);
            pck.st.lock().unwrap().pool = Some(pool.clone());
            Some(PoolNotifier::new(pool))
        })
    }
}

/// Default pool capacity mirrors the mailbox default.
pub const DEFAULT_POOL_CAPACITY: usize = DEFAULT_MAILBOX_CAPACITY;
