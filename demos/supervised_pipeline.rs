//! A supervisor actor owns a typed intake, delegates consumption to a
//! worker child, and tears the whole tree down with a force-quit once the
//! producers are done.
//!
//! Run with: cargo run --example supervised_pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use weft::{Actor, Executor, SpawnOptions};

fn main() {
    weft::logging::init_default();

    let exec = Executor::new();
    exec.open(2);

    let processed = Arc::new(AtomicU64::new(0));

    let counter = processed.clone();
    let supervisor = Actor::create(exec.make_strand(), move |me| async move {
        let _worker = me
            .msg_agent_to_actor::<u64, _, _>(true, SpawnOptions::new(), move |c, pump| async move {
                loop {
                    match c.pump_msg(&pump, true).await {
                        Ok(value) => {
                            counter.fetch_add(value, Ordering::Relaxed);
                        }
                        Err(_) => break,
                    }
                }
            })
            .await;

        // Watchdog: the supervisor sleeps in quanta; a force-quit from the
        // outside unwinds it here and collects the worker.
        let _cleanup = me.regist_quit_handler(|| tracing::info!("pipeline shut down"));
        loop {
            me.sleep(250).await;
        }
    });
    let intake = supervisor.connect_msg_notifier::<u64>(64).unwrap();
    supervisor.notify_run();

    let mut producers = Vec::new();
    for p in 0..4u64 {
        let intake = intake.clone();
        producers.push(std::thread::spawn(move || {
            for i in 0..1_000 {
                intake.send(p * 1_000 + i);
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    // Give the pipeline a moment to drain, then collapse the tree.
    std::thread::sleep(std::time::Duration::from_millis(300));
    supervisor.notify_quit();
    supervisor.outside_wait_quit();

    println!("sum of processed values: {}", processed.load(Ordering::Relaxed));
    exec.close();
}
