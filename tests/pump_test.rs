//! Pump/pool channel: ping-pong throughput, consumer migration, and
//! disconnect signaling.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::{Actor, PoolNotifier, SpawnOptions};

/// Scenario: two actors on distinct strands bounce a counter through a pair
/// of pump/pool channels. Every read in lockstep ping-pong finds the pool
/// empty and suspends, so the receiver's yield count tracks the number of
/// messages it consumed.
#[test]
fn ping_pong_across_strands() {
    let exec = common::pool(4);
    const LIMIT: u32 = 20_000;

    let (to_b_tx, to_b_rx) = flume::bounded::<PoolNotifier<u32>>(1);
    let (to_a_tx, to_a_rx) = flume::bounded::<PoolNotifier<u32>>(1);
    let (yields_tx, yields_rx) = flume::bounded(1);

    let a = Actor::create(exec.make_strand(), move |me| async move {
        let to_b = to_b_rx.recv().unwrap();
        let pump = me.connect_msg_pump::<u32>().await;
        loop {
            let n = me.pump_msg(&pump, false).await.unwrap();
            if n >= LIMIT {
                break;
            }
            to_b.send(n + 1);
        }
        yields_tx.send(me.yield_count()).unwrap();
    });
    let b = Actor::create(exec.make_strand(), move |me| async move {
        let to_a = to_a_rx.recv().unwrap();
        let pump = me.connect_msg_pump::<u32>().await;
        loop {
            let n = me.pump_msg(&pump, false).await.unwrap();
            to_a.send(n + 1);
            if n + 1 >= LIMIT {
                break;
            }
        }
    });

    let to_a = a.connect_msg_notifier::<u32>(16).unwrap();
    let to_b = b.connect_msg_notifier::<u32>(16).unwrap();
    to_b_tx.send(to_b).unwrap();
    to_a_tx.send(to_a.clone()).unwrap();
    a.notify_run();
    b.notify_run();

    to_a.send(0);

    assert!(a.outside_wait_quit());
    assert!(b.outside_wait_quit());

    // A consumes 0, 2, ..., LIMIT: LIMIT/2 + 1 messages, each but possibly
    // the first parked the reader once.
    let yields = yields_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let consumed = (LIMIT / 2 + 1) as u64;
    assert!(
        yields >= consumed - 1 && yields <= consumed,
        "yield count {yields} for {consumed} consumed messages"
    );
    exec.close();
}

/// Scenario: the parent reads the first messages, delegates the type to a
/// child, and the child reads everything produced after the relink.
/// Exactly-once, FIFO, and the parent observes nothing post-delegation.
#[test]
fn delegation_moves_the_consumer_without_loss() {
    let exec = common::pool(2);
    let parent_saw: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let child_saw: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let parent_quiet_after = Arc::new(AtomicBool::new(false));
    let (relinked_tx, relinked_rx) = flume::bounded(1);

    let parent_saw2 = parent_saw.clone();
    let child_saw2 = child_saw.clone();
    let quiet = parent_quiet_after.clone();
    let child_exec = exec.clone();
    let parent = Actor::create(exec.make_strand(), move |me| async move {
        let pump = me.connect_msg_pump::<u32>().await;
        for _ in 0..2 {
            let v = me.pump_msg(&pump, false).await.unwrap();
            parent_saw2.lock().unwrap().push(v);
        }

        let child_seen = child_saw2.clone();
        let child_connected = Arc::new(AtomicBool::new(false));
        let connected_flag = child_connected.clone();
        let child_relinked = relinked_tx.clone();
        let mut child = me.create_child_actor_on(
            child_exec.make_strand(),
            SpawnOptions::new(),
            move |c| async move {
                let pump = c.connect_msg_pump::<u32>().await;
                connected_flag.store(true, Ordering::SeqCst);
                child_relinked.send(()).unwrap();
                loop {
                    let v = c.pump_msg(&pump, false).await.unwrap();
                    child_seen.lock().unwrap().push(v);
                    if v == 4 {
                        break;
                    }
                }
            },
        );
        me.msg_agent_to::<u32>(&child).await;
        me.child_actor_run(&mut child);
        while !child_connected.load(Ordering::SeqCst) {
            me.sleep(5).await;
        }

        // The canonical consumer moved; the parent's old pump is no longer
        // fed and a timed read drains nothing.
        let leftover = me.timed_pump_msg(80, &pump, false).await.unwrap();
        quiet.store(leftover.is_none(), Ordering::SeqCst);

        me.child_actor_wait_quit(&mut child).await;
    });
    let producer = parent.connect_msg_notifier::<u32>(16).unwrap();
    parent.notify_run();

    producer.send(0);
    producer.send(1);
    relinked_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    producer.send(2);
    producer.send(3);
    producer.send(4);

    assert!(parent.outside_wait_quit());
    assert_eq!(*parent_saw.lock().unwrap(), vec![0, 1]);
    assert_eq!(*child_saw.lock().unwrap(), vec![2, 3, 4]);
    assert!(parent_quiet_after.load(Ordering::SeqCst));
    exec.close();
}

/// Scenario: re-delegating a type away from one child disconnects that
/// child's pump; its blocked read with the disconnect check opted in fails
/// with `PumpDisconnected`.
#[test]
fn redelegation_raises_pump_disconnected_for_the_old_consumer() {
    let exec = common::pool(2);
    let (verdict_tx, verdict_rx) = flume::bounded(1);
    let delegated = Arc::new(AtomicBool::new(false));

    let delegated2 = delegated.clone();
    let parent = Actor::create(exec.make_strand(), move |me| async move {
        // Own the pool first so there is something to delegate.
        let _producer = me.connect_msg_notifier_to_self::<u32>(false, 16).await.unwrap();

        let flag = delegated2.clone();
        let verdict = verdict_tx.clone();
        let mut first = me.create_child_actor(move |c| async move {
            while !flag.load(Ordering::SeqCst) {
                c.sleep(5).await;
            }
            let pump = c.connect_msg_pump::<u32>().await;
            let outcome = c.pump_msg(&pump, true).await;
            verdict.send(outcome.is_err()).unwrap();
        });
        let mut second = me.create_child_actor(|c| async move {
            loop {
                c.sleep(1_000).await;
            }
        });
        me.child_actor_run(&mut first);
        me.child_actor_run(&mut second);

        me.msg_agent_to::<u32>(&first).await;
        delegated2.store(true, Ordering::SeqCst);

        // Give the first child time to bind its pump and block reading.
        me.sleep(100).await;
        me.msg_agent_to::<u32>(&second).await;

        me.child_actor_wait_quit(&mut first).await;
        me.child_actor_force_quit(&mut second).await;
    });
    parent.notify_run();

    assert!(
        verdict_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "old consumer must observe the disconnect"
    );
    assert!(parent.outside_wait_quit());
    exec.close();
}

/// Round trip: delegation followed by `msg_agent_off` restores the parent
/// as head for the type; messages produced across the transitions are each
/// delivered exactly once.
#[test]
fn msg_agent_off_restores_the_parent_as_head() {
    let exec = common::pool(2);
    let parent_saw: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let child_saw: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let (phase_tx, phase_rx) = flume::unbounded::<&'static str>();
    let (go_tx, go_rx) = flume::unbounded::<()>();

    let parent_saw2 = parent_saw.clone();
    let child_saw2 = child_saw.clone();
    let parent = Actor::create(exec.make_strand(), move |me| async move {
        let pump = me.connect_msg_pump::<u32>().await;
        phase_tx.send("pump-ready").unwrap();
        let v = me.pump_msg(&pump, false).await.unwrap();
        parent_saw2.lock().unwrap().push(v);

        let child_seen = child_saw2.clone();
        let child_phase = phase_tx.clone();
        let mut child = me.create_child_actor(move |c| async move {
            let pump = c.connect_msg_pump::<u32>().await;
            let v = c.pump_msg(&pump, false).await.unwrap();
            child_seen.lock().unwrap().push(v);
            child_phase.send("child-got-one").unwrap();
            loop {
                c.sleep(1_000).await;
            }
        });
        me.msg_agent_to::<u32>(&child).await;
        me.child_actor_run(&mut child);
        phase_tx.send("delegated").unwrap();

        // Wait for the go-ahead, then take the type back.
        go_rx.recv().unwrap();
        me.msg_agent_off::<u32>().await;
        let pump = me.connect_msg_pump::<u32>().await;
        phase_tx.send("restored").unwrap();
        let v = me.pump_msg(&pump, false).await.unwrap();
        parent_saw2.lock().unwrap().push(v);

        me.child_actor_force_quit(&mut child).await;
    });
    let producer = parent.connect_msg_notifier::<u32>(16).unwrap();
    parent.notify_run();

    assert_eq!(phase_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "pump-ready");
    producer.send(0);
    assert_eq!(phase_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "delegated");
    producer.send(1);
    assert_eq!(phase_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "child-got-one");
    go_tx.send(()).unwrap();
    assert_eq!(phase_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "restored");
    producer.send(2);

    assert!(parent.outside_wait_quit());
    assert_eq!(*parent_saw.lock().unwrap(), vec![0, 2]);
    assert_eq!(*child_saw.lock().unwrap(), vec![1]);
    exec.close();
}

/// A consumer that migrated to a dedicated agent child keeps draining the
/// producers started before the delegation.
#[test]
fn msg_agent_to_actor_spawns_a_consuming_child() {
    let exec = common::pool(2);
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = flume::bounded(1);

    let seen2 = seen.clone();
    let parent = Actor::create(exec.make_strand(), move |me| async move {
        let _producer = me.connect_msg_notifier_to_self::<u32>(false, 16).await.unwrap();
        let collected = seen2.clone();
        let done = done_tx.clone();
        let mut agent = me
            .msg_agent_to_actor::<u32, _, _>(true, SpawnOptions::new(), move |c, pump| async move {
                for _ in 0..3 {
                    let v = c.pump_msg(&pump, false).await.unwrap();
                    collected.lock().unwrap().push(v);
                }
                done.send(()).unwrap();
            })
            .await;
        me.child_actor_wait_quit(&mut agent).await;
    });
    // Pre-run notifier: the body's to_self connector reuses this pool.
    let feeder = parent.connect_msg_notifier::<u32>(16).unwrap();
    parent.notify_run();
    feeder.send(5);
    feeder.send(6);
    feeder.send(7);

    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(parent.outside_wait_quit());
    assert_eq!(*seen.lock().unwrap(), vec![5, 6, 7]);
    exec.close();
}
