//! Lifecycle, timing, and bridge behavior of single actors.

mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{Actor, ActorMutex, MsgHandle, SpawnOptions, TrigHandle};

#[test]
fn body_runs_and_exit_callback_reports_ok() {
    let exec = common::pool(2);
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create_with(
        exec.make_strand(),
        SpawnOptions::new().on_exit(move |ok| {
            tx.send(ok).unwrap();
        }),
        |me| async move {
            me.sleep(1).await;
        },
    );
    actor.notify_run();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    exec.close();
}

#[test]
fn actor_ids_increase_monotonically() {
    let exec = common::pool(1);
    let strand = exec.make_strand();
    let a = Actor::create(strand.clone(), |_| async {});
    let b = Actor::create(strand.clone(), |_| async {});
    let c = Actor::create(strand, |_| async {});
    assert!(a.self_id() < b.self_id());
    assert!(b.self_id() < c.self_id());
    exec.close();
}

#[test]
fn sleep_zero_is_a_yield_not_a_noop() {
    let exec = common::pool(1);
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        assert_eq!(me.yield_count(), 0);
        me.sleep(0).await;
        tx.send(me.yield_count()).unwrap();
    });
    actor.notify_run();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    assert!(actor.outside_wait_quit());
    exec.close();
}

#[test]
fn sleep_duration_is_respected() {
    let exec = common::pool(2);
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let start = Instant::now();
        me.sleep(60).await;
        tx.send(start.elapsed()).unwrap();
    });
    actor.notify_run();
    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(elapsed >= Duration::from_millis(55), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "woke late: {elapsed:?}");
    exec.close();
}

/// Scenario: a timed wait against an empty mailbox returns `None` near the
/// deadline, leaves the mailbox waiter-free, and a later untimed wait still
/// blocks until a sender shows up.
#[test]
fn timed_mailbox_wait_times_out_then_delivers() {
    let exec = common::pool(2);
    let (tx, rx) = flume::unbounded();
    let (notifier_tx, notifier_rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let handle = MsgHandle::<u32>::new();
        notifier_tx.send(me.make_msg_notifier(&handle)).unwrap();
        let start = Instant::now();
        let got = me.timed_wait_msg(50, &handle).await;
        tx.send((got.is_none(), start.elapsed())).unwrap();
        let value = me.wait_msg(&handle).await;
        tx.send((value == 7, Duration::ZERO)).unwrap();
    });
    actor.notify_run();

    let (timed_out, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(timed_out);
    assert!(elapsed >= Duration::from_millis(45), "timed out early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "timed out late: {elapsed:?}");

    let notifier = notifier_rx.recv().unwrap();
    notifier.send(7);
    let (delivered, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(delivered);
    assert!(actor.outside_wait_quit());
    exec.close();
}

#[test]
fn delay_trig_fires_through_the_strand() {
    let exec = common::pool(2);
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let th = TrigHandle::<u32>::new();
        let tn = me.make_trig_notifier(&th);
        me.delay_trig(20, move || tn.fire(9));
        let v = me.wait_trig(&th).await;
        tx.send(v).unwrap();
    });
    actor.notify_run();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
    exec.close();
}

/// Round trip: a cancelled delay never fires, for any positive delay.
#[test]
fn cancel_delay_trig_prevents_firing() {
    let exec = common::pool(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let hits = hits2.clone();
        me.delay_trig(20, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        me.cancel_delay_trig();
        me.sleep(100).await;
    });
    actor.notify_run();
    assert!(actor.outside_wait_quit());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    exec.close();
}

#[test]
fn send_runs_on_target_strand_and_returns_value() {
    let exec = common::pool(4);
    let worker_strand = exec.make_strand();
    let (tx, rx) = flume::bounded(1);
    let probe = worker_strand.clone();
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let yields_before = me.yield_count();
        let r = me
            .send(&worker_strand, move || {
                assert!(probe.running_in_this_thread());
                21 * 2
            })
            .await;
        let crossed = me.yield_count() > yields_before;

        // Same-strand send executes inline, without a yield.
        let own = me.self_strand().clone();
        let yields_mid = me.yield_count();
        let r2 = me.send(&own, || 5).await;
        let inline = me.yield_count() == yields_mid;
        tx.send((r, crossed, r2, inline)).unwrap();
    });
    actor.notify_run();
    let (r, crossed, r2, inline) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(r, 42);
    assert!(crossed);
    assert_eq!(r2, 5);
    assert!(inline);
    exec.close();
}

#[test]
fn stack_accounting_stays_within_budget() {
    let exec = common::pool(1);
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create_with(
        exec.make_strand(),
        SpawnOptions::new().stack_size(128 * 1024),
        move |me| async move {
            me.check_stack();
            tx.send((me.stack_size(), me.stack_free_space())).unwrap();
        },
    );
    actor.notify_run();
    let (size, free) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(size, 128 * 1024);
    assert!(free > 0 && free <= size);
    exec.close();
}

/// Two actors on different strands increment a counter with a deliberate
/// read-yield-write race; the actor mutex must serialize the whole critical
/// section across yields.
#[test]
fn actor_mutex_excludes_across_yield_points() {
    let exec = common::pool(4);
    let mutex = ActorMutex::new();
    let counter = Arc::new(AtomicU64::new(0));
    const ROUNDS: u64 = 50;

    let mut actors = Vec::new();
    for _ in 0..2 {
        let mutex = mutex.clone();
        let counter = counter.clone();
        let actor = Actor::create(exec.make_strand(), move |me| async move {
            for _ in 0..ROUNDS {
                mutex.lock(&me).await;
                let seen = counter.load(Ordering::SeqCst);
                me.sleep(0).await;
                counter.store(seen + 1, Ordering::SeqCst);
                mutex.unlock(&me);
            }
        });
        actor.notify_run();
        actors.push(actor);
    }
    for actor in &actors {
        assert!(actor.outside_wait_quit());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2 * ROUNDS);
    assert_eq!(mutex.owner(), None);
    exec.close();
}

#[test]
fn mutex_is_reentrant_for_the_owner() {
    let exec = common::pool(2);
    let mutex = ActorMutex::new();
    let m2 = mutex.clone();
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        m2.lock(&me).await;
        m2.lock(&me).await;
        m2.unlock(&me);
        let still_owned = m2.owner() == Some(me.self_id());
        m2.unlock(&me);
        tx.send((still_owned, m2.owner().is_none())).unwrap();
    });
    actor.notify_run();
    let (still_owned, released) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(still_owned);
    assert!(released);
    exec.close();
}
