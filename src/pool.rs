//! Fixed-size object pool.
//!
//! A freelist of reusable objects behind a mutex. Pools are either *soft*
//! (fall back to the factory when empty, the default) or *hard-capped*
//! (acquire fails with [`PoolExhausted`] once every slot is outstanding).
//! The runtime uses soft pools to recycle actor carriers by stack-size
//! class when [`enable_stack_pool`](crate::actor::enable_stack_pool) is on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::PoolExhausted;

/// A freelist of `T` values shared between threads.
#[derive(Clone)]
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    free: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    /// Hard cap on objects in circulation. `None` means allocator fallback.
    cap: Option<usize>,
    outstanding: AtomicUsize,
    /// Maximum number of idle objects retained on release.
    keep: usize,
}

impl<T> ObjectPool<T> {
    /// A soft pool: `acquire` never fails, `release` keeps up to `keep`
    /// idle objects for reuse.
    pub fn new(keep: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                factory: Box::new(factory),
                cap: None,
                outstanding: AtomicUsize::new(0),
                keep,
            }),
        }
    }

    /// A hard-capped pool: at most `cap` objects exist at once.
    pub fn with_capacity(cap: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                factory: Box::new(factory),
                cap: Some(cap),
                outstanding: AtomicUsize::new(0),
                keep: cap,
            }),
        }
    }

    /// Take an object from the freelist, or manufacture one.
    pub fn acquire(&self) -> Result<T, PoolExhausted> {
        if let Some(obj) = self.inner.free.lock().unwrap().pop() {
            self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }
        if let Some(cap) = self.inner.cap {
            if self.inner.outstanding.load(Ordering::Relaxed) >= cap {
                return Err(PoolExhausted { capacity: cap });
            }
        }
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok((self.inner.factory)())
    }

    /// Return an object to the freelist. Objects beyond the retention limit
    /// are dropped.
    pub fn release(&self, obj: T) {
        self.inner.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.inner.free.lock().unwrap();
        if free.len() < self.inner.keep {
            free.push(obj);
        }
    }

    /// Number of idle objects currently retained.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Number of objects currently handed out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_pool_recycles() {
        let pool = ObjectPool::new(2, || Vec::<u8>::with_capacity(64));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.outstanding(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 2);
        let _c = pool.acquire().unwrap();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn soft_pool_drops_beyond_retention() {
        let pool = ObjectPool::new(1, || 0u32);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn hard_cap_exhausts() {
        let pool = ObjectPool::with_capacity(1, || 0u32);
        let held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert_eq!(err.capacity, 1);
        pool.release(held);
        assert!(pool.acquire().is_ok());
    }
}
