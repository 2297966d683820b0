//! Actor-aware mutual exclusion.
//!
//! A reentrant lock whose owner is an actor, not a thread. Acquisition is
//! only legal from inside an actor: a contended `lock` parks the calling
//! actor on a FIFO waiter list and yields; `unlock` hands ownership to the
//! next waiter and resumes it through its own strand.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::actor::bridge::TrigOnce;
use crate::actor::Actor;

/// Reentrant, strand-aware mutex. Cheap to clone; clones share the lock.
#[derive(Clone)]
pub struct ActorMutex {
    inner: Arc<Mutex<MutexState>>,
}

struct MutexState {
    owner: Option<u64>,
    depth: usize,
    waiters: VecDeque<(u64, TrigOnce<()>)>,
}

impl ActorMutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MutexState {
                owner: None,
                depth: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire for `actor`, yielding until ownership is granted. Reentrant:
    /// the owner may lock again and must unlock as many times.
    pub async fn lock(&self, actor: &Actor) {
        actor.assert_enter();
        let id = actor.self_id();
        let acquired = {
            let mut st = self.inner.lock().unwrap();
            match st.owner {
                None => {
                    st.owner = Some(id);
                    st.depth = 1;
                    true
                }
                Some(owner) if owner == id => {
                    st.depth += 1;
                    true
                }
                Some(_) => false,
            }
        };
        if acquired {
            return;
        }
        let inner = self.inner.clone();
        actor
            .trig(move |t| {
                let mut st = inner.lock().unwrap();
                match st.owner {
                    // The owner released between our fast path and here.
                    None => {
                        st.owner = Some(id);
                        st.depth = 1;
                        drop(st);
                        t.fire(());
                    }
                    Some(owner) if owner == id => {
                        st.depth += 1;
                        drop(st);
                        t.fire(());
                    }
                    Some(_) => st.waiters.push_back((id, t)),
                }
            })
            .await;
    }

    /// Release one level of ownership; at depth zero the next waiter (FIFO)
    /// becomes the owner and is resumed.
    pub fn unlock(&self, actor: &Actor) {
        let id = actor.self_id();
        let next = {
            let mut st = self.inner.lock().unwrap();
            debug_assert_eq!(st.owner, Some(id), "unlock by a non-owner actor");
            debug_assert!(st.depth > 0);
            st.depth = st.depth.saturating_sub(1);
            if st.depth > 0 {
                None
            } else {
                match st.waiters.pop_front() {
                    Some((next_id, trig)) => {
                        st.owner = Some(next_id);
                        st.depth = 1;
                        Some(trig)
                    }
                    None => {
                        st.owner = None;
                        None
                    }
                }
            }
        };
        if let Some(trig) = next {
            trig.fire(());
        }
    }

    /// Acquire and get a guard that releases on drop.
    pub async fn lock_guard(&self, actor: &Actor) -> ActorMutexGuard {
        self.lock(actor).await;
        ActorMutexGuard {
            mutex: self.clone(),
            actor: actor.clone(),
        }
    }

    /// The id of the owning actor, if any.
    pub fn owner(&self) -> Option<u64> {
        self.inner.lock().unwrap().owner
    }
}

impl Default for ActorMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped ownership of an [`ActorMutex`].
pub struct ActorMutexGuard {
    mutex: ActorMutex,
    actor: Actor,
}

impl Drop for ActorMutexGuard {
    fn drop(&mut self) {
        self.mutex.unlock(&self.actor);
    }
}
