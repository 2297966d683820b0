use thiserror::Error;

/// Returned by pump reads when the caller opted into the disconnect check
/// and the pump has no `PumpHandler` bound (typically because the packet was
/// delegated away from this actor).
///
/// This is a recoverable signal: the body may catch it, reconnect a pump or
/// fall back to another channel, and continue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message pump is disconnected from its pool")]
pub struct PumpDisconnected;

/// Raised by a hard-capped [`ObjectPool`](crate::pool::ObjectPool) when every
/// slot is outstanding. The runtime's own pools are not capped and fall back
/// to the allocator instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("object pool exhausted (capacity: {capacity})")]
pub struct PoolExhausted {
    pub capacity: usize,
}
