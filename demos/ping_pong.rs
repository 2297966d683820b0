//! Two actors on distinct strands bounce a counter through pump/pool
//! channels, then report throughput.
//!
//! Run with: cargo run --example ping_pong --release

use std::time::Instant;

use weft::{Actor, Executor, PoolNotifier};

const ROUNDS: u32 = 200_000;

fn main() {
    weft::logging::init_default();

    let exec = Executor::new();
    exec.open(4);

    let (to_b_tx, to_b_rx) = flume::bounded::<PoolNotifier<u32>>(1);
    let (to_a_tx, to_a_rx) = flume::bounded::<PoolNotifier<u32>>(1);

    let a = Actor::create(exec.make_strand(), move |me| async move {
        let to_b = to_b_rx.recv().unwrap();
        let pump = me.connect_msg_pump::<u32>().await;
        loop {
            let n = me.pump_msg(&pump, false).await.unwrap();
            if n >= ROUNDS {
                break;
            }
            to_b.send(n + 1);
        }
        tracing::info!(yields = me.yield_count(), "ping side done");
    });
    let b = Actor::create(exec.make_strand(), move |me| async move {
        let to_a = to_a_rx.recv().unwrap();
        let pump = me.connect_msg_pump::<u32>().await;
        loop {
            let n = me.pump_msg(&pump, false).await.unwrap();
            to_a.send(n + 1);
            if n + 1 >= ROUNDS {
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

    let start = Instant::now();
    to_a.send(0);
    a.outside_wait_quit();
    b.outside_wait_quit();
    let elapsed = start.elapsed();

    println!(
        "{ROUNDS} messages in {elapsed:?} ({:.0} msg/s)",
        ROUNDS as f64 / elapsed.as_secs_f64()
    );
    exec.close();
}
