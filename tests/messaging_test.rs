//! Mailbox and trigger delivery semantics.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::{Actor, MsgHandle, TrigHandle};

/// Each producer's stream arrives in the order it was sent, regardless of
/// interleaving between producers.
#[test]
fn mailbox_is_fifo_per_producer() {
    let exec = common::pool(4);
    const PER_PRODUCER: u32 = 200;
    let seen: Arc<Mutex<Vec<(u8, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let (notifier_tx, notifier_rx) = flume::bounded(1);

    let seen2 = seen.clone();
    let consumer = Actor::create(exec.make_strand(), move |me| async move {
        let handle = MsgHandle::<(u8, u32)>::with_capacity(32);
        notifier_tx.send(me.make_msg_notifier(&handle)).unwrap();
        for _ in 0..(3 * PER_PRODUCER) {
            let msg = me.wait_msg(&handle).await;
            seen2.lock().unwrap().push(msg);
        }
    });
    consumer.notify_run();
    let notifier = notifier_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut producers = Vec::new();
    for p in 0..3u8 {
        let notifier = notifier.clone();
        producers.push(std::thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                notifier.send((p, i));
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(consumer.outside_wait_quit());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3 * PER_PRODUCER as usize);
    for p in 0..3u8 {
        let stream: Vec<u32> = seen.iter().filter(|(pp, _)| *pp == p).map(|(_, i)| *i).collect();
        let expected: Vec<u32> = (0..PER_PRODUCER).collect();
        assert_eq!(stream, expected, "producer {p} out of order");
    }
    exec.close();
}

/// A trigger delivers exactly once; reading again reports nothing left.
#[test]
fn trigger_is_single_shot() {
    let exec = common::pool(2);
    let (tx, rx) = flume::bounded(1);
    let (notifier_tx, notifier_rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let handle = TrigHandle::<u32>::new();
        notifier_tx.send(me.make_trig_notifier(&handle)).unwrap();
        let first = me.wait_trig(&handle).await;
        let closed = handle.is_closed();
        let second = me.timed_wait_trig(10, &handle).await;
        tx.send((first, closed, second.is_none())).unwrap();
    });
    actor.notify_run();
    let notifier = notifier_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    notifier.fire(11);

    let (first, closed, empty_after) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, 11);
    assert!(closed);
    assert!(empty_after);
    exec.close();
}

#[test]
fn timed_trigger_wait_times_out() -> anyhow::Result<()> {
    let exec = common::pool(2);
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let handle = TrigHandle::<u32>::new();
        let _notifier = me.make_trig_notifier(&handle);
        let got = me.timed_wait_trig(30, &handle).await;
        tx.send(got).unwrap();
    });
    actor.notify_run();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, None);
    assert!(actor.outside_wait_quit());
    exec.close();
    Ok(())
}

/// Messages sent after the host actor has quit are silently dropped, and
/// notifiers outlive the actor without incident.
#[test]
fn notifier_outliving_the_actor_is_harmless() {
    let exec = common::pool(2);
    let (notifier_tx, notifier_rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let handle = MsgHandle::<u32>::new();
        notifier_tx.send(me.make_msg_notifier(&handle)).unwrap();
    });
    actor.notify_run();
    let notifier = notifier_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(actor.outside_wait_quit());
    notifier.send(1);
    notifier.send(2);
    std::thread::sleep(Duration::from_millis(30));
    exec.close();
}

#[test]
fn delay_push_trig_delivers_after_the_delay() -> anyhow::Result<()> {
    let exec = common::pool(2);
    let (tx, rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let handle = TrigHandle::<&'static str>::new();
        let _notifier = me.make_trig_notifier(&handle);
        me.delay_push_trig(25, &handle, "late");
        let got = me.wait_trig(&handle).await;
        tx.send(got).unwrap();
    });
    actor.notify_run();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, "late");
    exec.close();
    Ok(())
}

/// A mailbox handed from one wait to the next keeps buffering while the
/// consumer is busy elsewhere.
#[test]
fn mailbox_buffers_between_waits() {
    let exec = common::pool(2);
    let (tx, rx) = flume::bounded(1);
    let (notifier_tx, notifier_rx) = flume::bounded(1);
    let actor = Actor::create(exec.make_strand(), move |me| async move {
        let handle = MsgHandle::<u32>::with_capacity(4);
        notifier_tx.send(me.make_msg_notifier(&handle)).unwrap();
        let first = me.wait_msg(&handle).await;
        // Busy elsewhere while more traffic arrives.
        me.sleep(60).await;
        let mut rest = Vec::new();
        while let Some(v) = me.timed_wait_msg(0, &handle).await {
            rest.push(v);
            if rest.len() == 2 {
                break;
            }
        }
        tx.send((first, rest)).unwrap();
    });
    actor.notify_run();
    let notifier = notifier_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    notifier.send(10);
    notifier.send(11);
    notifier.send(12);
    let (first, rest) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, 10);
    assert_eq!(rest, vec![11, 12]);
    assert!(actor.outside_wait_quit());
    exec.close();
}
