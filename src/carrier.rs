//! # Carrier
//!
//! The suspension/resumption machinery under every actor. An actor body is
//! a boxed future that is only ever polled deliberately, on its home strand,
//! with a no-op waker: "resume" is an explicit strand task, never a waker
//! wake-up. Suspension is a [`YieldPoint`] that returns `Pending` exactly
//! once, so control transfers back to the worker that polled, and the next
//! deliberate poll continues the body from the same point.
//!
//! The carrier also meters the body's use of the worker stack. Each actor
//! declares a stack budget (default 64 KiB, 4 KiB granule, 1 MiB max); the
//! strand records an approximate stack pointer when it enters the body, and
//! `check_stack`/`stack_free_space` measure the current frame against that
//! budget.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::noop_waker_ref;

use crate::pool::ObjectPool;

/// Default actor stack budget, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Stack budgets are multiples of this granule.
pub const STACK_GRANULE: usize = 4 * 1024;
/// Smallest permitted stack budget.
pub const MIN_STACK_SIZE: usize = STACK_GRANULE;
/// Largest permitted stack budget.
pub const MAX_STACK_SIZE: usize = 1024 * 1024;
/// `check_stack` fails once free space falls below this margin.
pub const STACK_MARGIN: usize = 1024;

/// Validate a requested stack budget. Out-of-contract values are a usage
/// error; release builds round into range instead.
pub(crate) fn validate_stack_size(requested: usize) -> usize {
    debug_assert!(
        requested >= MIN_STACK_SIZE
            && requested <= MAX_STACK_SIZE
            && requested % STACK_GRANULE == 0,
        "stack size must be a 4 KiB multiple in 4 KiB..=1 MiB, got {requested}"
    );
    let clamped = requested.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE);
    clamped.div_ceil(STACK_GRANULE) * STACK_GRANULE
}

/// An approximation of the current stack pointer.
#[inline(never)]
pub(crate) fn approx_stack_pointer() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

/// Bytes of budget left given the entry-point stack pointer recorded by the
/// strand. The stack grows downward.
pub(crate) fn free_stack_space(entry_sp: usize, stack_size: usize) -> usize {
    let current = approx_stack_pointer();
    stack_size.saturating_sub(entry_sp.saturating_sub(current))
}

/// Awaitable suspension point: `Pending` on the first poll, `Ready` on the
/// next. Because bodies are only polled deliberately, the second poll *is*
/// the resumption.
pub(crate) struct YieldPoint {
    yielded: bool,
}

pub(crate) fn yield_once() -> YieldPoint {
    YieldPoint { yielded: false }
}

impl Future for YieldPoint {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

/// Poll an actor body once with the no-op waker.
pub(crate) fn poll_body(body: &mut BoxFuture<'static, ()>) -> Poll<()> {
    let mut cx = Context::from_waker(noop_waker_ref());
    body.as_mut().poll(&mut cx)
}

/// Per-actor execution state owned by the strand side: the suspended body
/// and its stack budget. Boxed so the stack pool can recycle allocations by
/// budget class.
pub(crate) struct Carrier {
    pub(crate) body: Option<BoxFuture<'static, ()>>,
    pub(crate) stack_size: usize,
}

static STACK_POOL_ENABLED: AtomicBool = AtomicBool::new(false);

fn stack_pools() -> &'static Mutex<HashMap<usize, ObjectPool<Box<Carrier>>>> {
    static POOLS: OnceLock<Mutex<HashMap<usize, ObjectPool<Box<Carrier>>>>> = OnceLock::new();
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Turn on carrier recycling by stack-budget size class. Process-wide and
/// irreversible, matching the original runtime's knob.
pub fn enable_stack_pool() {
    STACK_POOL_ENABLED.store(true, Ordering::Relaxed);
}

pub(crate) fn stack_pool_enabled() -> bool {
    STACK_POOL_ENABLED.load(Ordering::Relaxed)
}

pub(crate) fn acquire_carrier(stack_size: usize) -> Box<Carrier> {
    if stack_pool_enabled() {
        let pools = stack_pools().lock().unwrap();
        if let Some(pool) = pools.get(&stack_size) {
            // Soft pool: acquire cannot fail.
            let mut carrier = pool.acquire().unwrap_or_else(|_| new_carrier(stack_size));
            carrier.body = None;
            return carrier;
        }
    }
    new_carrier(stack_size)
}

pub(crate) fn release_carrier(mut carrier: Box<Carrier>) {
    if !stack_pool_enabled() {
        return;
    }
    carrier.body = None;
    let stack_size = carrier.stack_size;
    let mut pools = stack_pools().lock().unwrap();
    pools
        .entry(stack_size)
        .or_insert_with(|| ObjectPool::new(64, move || new_carrier(stack_size)))
        .release(carrier);
}

fn new_carrier(stack_size: usize) -> Box<Carrier> {
    Box::new(Carrier {
        body: None,
        stack_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yield_point_is_pending_exactly_once() {
        let mut fut: BoxFuture<'static, ()> = Box::pin(async {
            yield_once().await;
            yield_once().await;
        });
        assert_eq!(poll_body(&mut fut), Poll::Pending);
        assert_eq!(poll_body(&mut fut), Poll::Pending);
        assert_eq!(poll_body(&mut fut), Poll::Ready(()));
    }

    #[test]
    fn stack_sizes_round_into_contract() {
        assert_eq!(validate_stack_size(DEFAULT_STACK_SIZE), DEFAULT_STACK_SIZE);
        assert_eq!(validate_stack_size(MAX_STACK_SIZE), MAX_STACK_SIZE);
    }

    #[test]
    fn free_space_shrinks_with_depth() {
        let entry = approx_stack_pointer();
        fn deeper(entry: usize) -> usize {
            let _padding = [0u8; 512];
            free_stack_space(entry, DEFAULT_STACK_SIZE)
        }
        let shallow = free_stack_space(entry, DEFAULT_STACK_SIZE);
        let deep = deeper(entry);
        assert!(deep <= shallow);
    }
}
