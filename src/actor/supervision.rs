//! Supervision: child actors and peer-actor control.
//!
//! Parents own children strongly and are removed from the tree only after
//! every transitive child has exited. The waiting primitives here are all
//! built on the one-shot trigger bridge: the parent yields until the
//! observed transition (exit, pause, unpause) completes on the child's
//! side, so they are safe to call concurrently from several parents or
//! repeatedly for the same child.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::actor::bridge::TrigOnce;
use crate::actor::{Actor, SpawnOptions};
use crate::strand::Strand;

/// Owned handle to a spawned child. Not clonable: run/join bookkeeping has
/// a single owner, the parent body.
pub struct ChildHandle {
    actor: Actor,
    launched: bool,
    joined: bool,
    ok: bool,
}

impl ChildHandle {
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn id(&self) -> u64 {
        self.actor.self_id()
    }

    /// True once the child has been observed to exit via one of the wait
    /// calls.
    pub fn is_joined(&self) -> bool {
        self.joined
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if !self.joined {
            // The parent's teardown force-quits and awaits the child.
            debug!(child = self.actor.self_id(), "child handle dropped before join");
        }
    }
}

/// Shared countdown that fires a one-shot trigger when every branch has
/// reported in.
struct Countdown {
    remaining: AtomicUsize,
    trig: TrigOnce<()>,
}

impl Countdown {
    fn new(count: usize, trig: TrigOnce<()>) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            trig,
        })
    }

    fn tick(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.trig.fire(());
        }
    }
}

impl Actor {
    // ---------------------------------------------------------------------
    // Spawning children

    /// Spawn a child on this actor's own strand with default options. The
    /// child does not run until [`child_actor_run`](Self::child_actor_run).
    pub fn create_child_actor<F, Fut>(&self, body: F) -> ChildHandle
    where
        F: FnOnce(Actor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.create_child_actor_on(self.self_strand().clone(), SpawnOptions::new(), body)
    }

    /// Spawn a child on an explicit strand with explicit options.
    pub fn create_child_actor_on<F, Fut>(
        &self,
        strand: Strand,
        options: SpawnOptions,
        body: F,
    ) -> ChildHandle
    where
        F: FnOnce(Actor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.assert_enter();
        let child = Actor::create_internal(strand, options, Arc::downgrade(self.core()), body);
        // The supervision list is only touched on the parent's strand,
        // which is where we are.
        self.core()
            .with_shared(|st| st.children.push(child.clone()));
        debug!(parent = self.self_id(), child = child.self_id(), "child created");
        ChildHandle {
            actor: child,
            launched: false,
            joined: false,
            ok: false,
        }
    }

    /// Start a child. Callable once per child.
    pub fn child_actor_run(&self, handle: &mut ChildHandle) {
        self.assert_enter();
        debug_assert!(!handle.launched, "child started twice");
        if handle.launched {
            return;
        }
        handle.launched = true;
        handle.actor.notify_run();
    }

    /// Start a batch of children.
    pub fn child_actors_run(&self, handles: &mut [ChildHandle]) {
        for handle in handles {
            self.child_actor_run(handle);
        }
    }

    // ---------------------------------------------------------------------
    // Waiting on children

    /// Yield until the child exits; returns true iff it completed normally.
    pub async fn child_actor_wait_quit(&self, handle: &mut ChildHandle) -> bool {
        self.assert_enter();
        if handle.joined {
            return handle.ok;
        }
        let target = handle.actor.clone();
        let ok = self
            .trig(move |t| target.append_quit_callback(move |ok| t.fire(ok)))
            .await;
        handle.joined = true;
        handle.ok = ok;
        ok
    }

    /// Yield until every child in the batch exits; true iff all of them
    /// completed normally.
    pub async fn child_actors_wait_quit(&self, handles: &mut [ChildHandle]) -> bool {
        self.assert_enter();
        let mut all_ok = true;
        for handle in handles {
            all_ok &= self.child_actor_wait_quit(handle).await;
        }
        all_ok
    }

    /// Force-quit the child and yield until it is fully gone (including its
    /// own transitive children). Returns the child's exit result.
    pub async fn child_actor_force_quit(&self, handle: &mut ChildHandle) -> bool {
        self.assert_enter();
        if handle.joined {
            return handle.ok;
        }
        let target = handle.actor.clone();
        let ok = self
            .trig(move |t| target.notify_quit_with(move |ok| t.fire(ok)))
            .await;
        handle.joined = true;
        handle.ok = ok;
        ok
    }

    /// Force-quit a batch of children and yield until all are gone.
    pub async fn child_actors_force_quit(&self, handles: &mut [ChildHandle]) {
        self.assert_enter();
        for handle in handles {
            self.child_actor_force_quit(handle).await;
        }
    }

    /// Pause the child's subtree and yield until it has settled.
    pub async fn child_actor_suspend(&self, handle: &ChildHandle) {
        self.actor_suspend(&handle.actor).await;
    }

    pub async fn child_actors_suspend(&self, handles: &[ChildHandle]) {
        let actors: Vec<Actor> = handles.iter().map(|h| h.actor.clone()).collect();
        self.actors_suspend(&actors).await;
    }

    /// Unpause the child's subtree and yield until it has settled.
    pub async fn child_actor_resume(&self, handle: &ChildHandle) {
        self.actor_resume(&handle.actor).await;
    }

    pub async fn child_actors_resume(&self, handles: &[ChildHandle]) {
        let actors: Vec<Actor> = handles.iter().map(|h| h.actor.clone()).collect();
        self.actors_resume(&actors).await;
    }

    /// Spawn a child, run it, and yield until it finishes. Returns true iff
    /// it completed normally.
    pub async fn run_child_actor_complete<F, Fut>(
        &self,
        strand: Strand,
        options: SpawnOptions,
        body: F,
    ) -> bool
    where
        F: FnOnce(Actor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.create_child_actor_on(strand, options, body);
        self.child_actor_run(&mut handle);
        self.child_actor_wait_quit(&mut handle).await
    }

    // ---------------------------------------------------------------------
    // Peer actors (not necessarily children)

    /// Start a batch of peer actors.
    pub fn actors_start_run(&self, actors: &[Actor]) {
        self.assert_enter();
        for actor in actors {
            actor.notify_run();
        }
    }

    /// Yield until the peer exits; returns its exit result.
    pub async fn actor_wait_quit(&self, actor: &Actor) -> bool {
        self.assert_enter();
        let target = actor.clone();
        self.trig(move |t| target.append_quit_callback(move |ok| t.fire(ok)))
            .await
    }

    /// Yield until every peer exits; true iff all completed normally.
    pub async fn actors_wait_quit(&self, actors: &[Actor]) -> bool {
        self.assert_enter();
        if actors.is_empty() {
            return true;
        }
        let all_ok = Arc::new(AtomicBool::new(true));
        let flag = all_ok.clone();
        let targets: Vec<Actor> = actors.to_vec();
        self.trig(move |t| {
            let countdown = Countdown::new(targets.len(), t);
            for target in targets {
                let countdown = countdown.clone();
                let flag = flag.clone();
                target.append_quit_callback(move |ok| {
                    if !ok {
                        flag.store(false, Ordering::SeqCst);
                    }
                    countdown.tick();
                });
            }
        })
        .await;
        all_ok.load(Ordering::SeqCst)
    }

    /// Force-quit a peer and yield until it is gone.
    pub async fn actor_force_quit(&self, actor: &Actor) -> bool {
        self.assert_enter();
        let target = actor.clone();
        self.trig(move |t| target.notify_quit_with(move |ok| t.fire(ok)))
            .await
    }

    /// Force-quit a batch of peers and yield until all are gone.
    pub async fn actors_force_quit(&self, actors: &[Actor]) {
        self.assert_enter();
        if actors.is_empty() {
            return;
        }
        let targets: Vec<Actor> = actors.to_vec();
        self.trig(move |t| {
            let countdown = Countdown::new(targets.len(), t);
            for target in targets {
                let countdown = countdown.clone();
                target.notify_quit_with(move |_ok| countdown.tick());
            }
        })
        .await;
    }

    /// Pause a peer's subtree and yield until it has settled.
    pub async fn actor_suspend(&self, actor: &Actor) {
        self.assert_enter();
        let target = actor.clone();
        self.trig(move |t| target.notify_suspend_with(move || t.fire(())))
            .await
    }

    pub async fn actors_suspend(&self, actors: &[Actor]) {
        self.assert_enter();
        if actors.is_empty() {
            return;
        }
        let targets: Vec<Actor> = actors.to_vec();
        self.trig(move |t| {
            let countdown = Countdown::new(targets.len(), t);
            for target in targets {
                let countdown = countdown.clone();
                target.notify_suspend_with(move || countdown.tick());
            }
        })
        .await;
    }

    /// Unpause a peer's subtree and yield until it has settled.
    pub async fn actor_resume(&self, actor: &Actor) {
        self.assert_enter();
        let target = actor.clone();
        self.trig(move |t| target.notify_resume_with(move || t.fire(())))
            .await
    }

    pub async fn actors_resume(&self, actors: &[Actor]) {
        self.assert_enter();
        if actors.is_empty() {
            return;
        }
        let targets: Vec<Actor> = actors.to_vec();
        self.trig(move |t| {
            let countdown = Countdown::new(targets.len(), t);
            for target in targets {
                let countdown = countdown.clone();
                target.notify_resume_with(move || countdown.tick());
            }
        })
        .await;
    }

    /// Toggle a peer between paused and running; returns true iff it ended
    /// up paused.
    pub async fn actor_switch(&self, actor: &Actor) -> bool {
        self.assert_enter();
        let target = actor.clone();
        self.trig(move |t| target.switch_pause_play_with(move |paused| t.fire(paused)))
            .await
    }

    /// Toggle a batch of peers; true iff all of them ended up paused.
    pub async fn actors_switch(&self, actors: &[Actor]) -> bool {
        self.assert_enter();
        if actors.is_empty() {
            return true;
        }
        let all_paused = Arc::new(AtomicBool::new(true));
        let flag = all_paused.clone();
        let targets: Vec<Actor> = actors.to_vec();
        self.trig(move |t| {
            let countdown = Countdown::new(targets.len(), t);
            for target in targets {
                let countdown = countdown.clone();
                let flag = flag.clone();
                target.switch_pause_play_with(move |paused| {
                    if !paused {
                        flag.store(false, Ordering::SeqCst);
                    }
                    countdown.tick();
                });
            }
        })
        .await;
        all_paused.load(Ordering::SeqCst)
    }
}
