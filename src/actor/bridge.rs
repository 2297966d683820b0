//! Async bridge: run work on another strand (or hand a one-shot callback to
//! an external API) and yield the calling actor until the result lands.
//!
//! Cancellation during an outstanding bridge call is not supported: an actor
//! that must see the completion holds a [`QuitGuard`](crate::actor::QuitGuard)
//! around it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::actor::{Actor, ActorCore};
use crate::carrier::yield_once;
use crate::strand::Strand;

/// One-shot notifier that resumes the actor awaiting a
/// [`trig`](Actor::trig) call. Cheap to clone; the first `fire` across all
/// clones wins, further fires are a usage error and are dropped.
pub struct TrigOnce<R: Send + 'static> {
    core: Arc<ActorCore>,
    slot: Arc<Mutex<Option<R>>>,
    fired: Arc<AtomicBool>,
}

impl<R: Send + 'static> Clone for TrigOnce<R> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            slot: self.slot.clone(),
            fired: self.fired.clone(),
        }
    }
}

impl<R: Send + 'static> TrigOnce<R> {
    /// Deliver the result and resume the waiting actor. Safe from any
    /// thread; hops to the actor's strand as needed. A no-op once the actor
    /// has quit.
    pub fn fire(&self, value: R) {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "one-shot notifier fired twice");
            return;
        }
        let core = self.core.clone();
        let slot = self.slot.clone();
        self.core.strand().dispatch(move || {
            if core.quited() {
                return;
            }
            *slot.lock().unwrap() = Some(value);
            ActorCore::run_one(&core);
        });
    }
}

impl Actor {
    /// Hand a one-shot notifier to `f` (typically the start of some
    /// callback-style asynchronous operation) and yield until it fires.
    pub async fn trig<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(TrigOnce<R>),
    {
        self.assert_enter();
        let slot = Arc::new(Mutex::new(None));
        let notifier = TrigOnce {
            core: self.core().clone(),
            slot: slot.clone(),
            fired: Arc::new(AtomicBool::new(false)),
        };
        f(notifier);
        loop {
            yield_once().await;
            if let Some(value) = slot.lock().unwrap().take() {
                return value;
            }
            // The only arranged wake is the notifier; anything else is a
            // protocol violation.
            debug_assert!(false, "trig wake without a value");
        }
    }

    /// Run `f` on `strand` and yield until its result comes back. Executes
    /// inline, without yielding, when `strand` is this actor's own.
    pub async fn send<R, F>(&self, strand: &Strand, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.assert_enter();
        if strand == self.self_strand() {
            return f();
        }
        let target = strand.clone();
        self.trig(move |t| {
            target.async_invoke(f, move |r| t.fire(r));
        })
        .await
    }

    /// Like [`send`](Self::send), but always takes the cross-strand hop,
    /// even to this actor's own strand.
    pub async fn async_send<R, F>(&self, strand: &Strand, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.assert_enter();
        let target = strand.clone();
        self.trig(move |t| {
            target.async_invoke(f, move |r| t.fire(r));
        })
        .await
    }
}
