//! # Typed messaging
//!
//! Three channel shapes, all with exactly one consuming actor:
//!
//! - [`MsgHandle`]: bounded-preallocation FIFO owned by the consumer, fed by
//!   cheap clonable [`MsgNotifier`]s
//! - [`TrigHandle`]: single-shot slot, closed after one delivery
//! - [`MsgPool`]/[`MsgPump`]: a many-producer channel whose consumer
//!   endpoint can migrate between actors without message loss, including
//!   delegation to child actors
//!
//! Producers never touch consumer state directly: every delivery hops onto
//! the consuming side's strand first, so channel state is strand-confined
//! and the single mutex around it is uncontended.

pub mod agent;
pub mod handle;
pub mod pump;

pub use agent::{PoolNotifier, DEFAULT_POOL_CAPACITY};
pub use handle::{MsgHandle, MsgNotifier, TrigHandle, TrigNotifier};
pub use pump::{MsgPool, MsgPump};
