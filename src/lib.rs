//! # weft
//!
//! A cooperative actor runtime: thousands of lightweight actors over a
//! fixed pool of worker threads. Each actor is pinned to a [`Strand`], a
//! serialized execution queue on top of the shared [`Executor`], and runs
//! as an async body that suspends only at the runtime's explicit yield
//! points: sleeps, message waits, bridge calls, and supervision waits.
//!
//! Actors spawn and supervise children (a parent never finishes before its
//! transitive children are gone), exchange typed messages through
//! single-shot triggers, bounded mailboxes, and migratable pump/pool
//! channels, and are cancelled by force-quit, which unwinds the body at its
//! current yield point and runs registered quit handlers in LIFO order.
//!
//! ```
//! use weft::{Actor, Executor};
//!
//! let exec = Executor::new();
//! exec.open(2);
//!
//! let actor = Actor::create(exec.make_strand(), |me| async move {
//!     me.sleep(5).await;
//! });
//! actor.notify_run();
//! assert!(actor.outside_wait_quit());
//!
//! exec.close();
//! ```

pub mod actor;
pub mod error;
pub mod executor;
pub mod logging;
pub mod msg;
pub mod pool;
pub mod strand;
pub mod sync;

mod carrier;
mod timer;

pub use actor::bridge::TrigOnce;
pub use actor::supervision::ChildHandle;
pub use actor::{disable_auto_make_timer, enable_stack_pool, Actor, QuitGuard, QuitKey, SpawnOptions};
pub use carrier::{DEFAULT_STACK_SIZE, MAX_STACK_SIZE, MIN_STACK_SIZE, STACK_GRANULE};
pub use error::{PoolExhausted, PumpDisconnected};
pub use executor::{Executor, Priority, TimerKey};
pub use msg::handle::DEFAULT_MAILBOX_CAPACITY;
pub use msg::{MsgHandle, MsgNotifier, MsgPool, MsgPump, PoolNotifier, TrigHandle, TrigNotifier};
pub use strand::Strand;
pub use sync::{ActorMutex, ActorMutexGuard};
