//! Per-actor delay slot.
//!
//! Each actor carries at most one outstanding delay. The slot is generation
//! counted: arming or cancelling bumps the generation, and an expiry task
//! whose generation no longer matches is stale and discarded. Pausing the
//! actor parks the remaining time so resume can re-arm the same generation.

use std::time::{Duration, Instant};

use crate::executor::TimerKey;

type DelayHandler = Box<dyn FnOnce() + Send>;

pub(crate) struct TimerSlot {
    generation: u64,
    key: Option<TimerKey>,
    deadline: Option<Instant>,
    /// Time left when the actor was paused; `Some(ZERO)` when the delay
    /// expired while paused and must re-fire on resume.
    remaining: Option<Duration>,
    handler: Option<DelayHandler>,
}

impl TimerSlot {
    pub(crate) fn new() -> Self {
        Self {
            generation: 0,
            key: None,
            deadline: None,
            remaining: None,
            handler: None,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.handler.is_some()
    }

    /// Install a new delay, superseding whatever was pending. Returns the
    /// generation the expiry task must present.
    pub(crate) fn arm(&mut self, deadline: Instant, handler: DelayHandler) -> u64 {
        debug_assert!(
            self.handler.is_none(),
            "delay re-armed before the previous one fired or was cancelled"
        );
        self.generation = self.generation.wrapping_add(1);
        self.deadline = Some(deadline);
        self.remaining = None;
        self.handler = Some(handler);
        self.generation
    }

    pub(crate) fn set_key(&mut self, key: TimerKey) {
        self.key = Some(key);
    }

    /// Claim the handler for a matching expiry. Stale generations get `None`.
    pub(crate) fn take_fired(&mut self, generation: u64) -> Option<DelayHandler> {
        if generation != self.generation {
            return None;
        }
        self.key = None;
        self.deadline = None;
        self.remaining = None;
        self.handler.take()
    }

    /// An expiry arrived while the actor was paused: keep the handler and
    /// mark the delay due immediately on resume.
    pub(crate) fn defer_fired(&mut self, generation: u64) {
        if generation == self.generation && self.handler.is_some() {
            self.key = None;
            self.deadline = None;
            self.remaining = Some(Duration::ZERO);
        }
    }

    /// Drop the pending delay. Returns the executor key to cancel, if one
    /// was scheduled.
    pub(crate) fn cancel(&mut self) -> Option<TimerKey> {
        self.generation = self.generation.wrapping_add(1);
        self.deadline = None;
        self.remaining = None;
        self.handler = None;
        self.key.take()
    }

    /// Park the delay for actor suspension, recording the remaining time.
    pub(crate) fn pause(&mut self, now: Instant) -> Option<TimerKey> {
        if let Some(deadline) = self.deadline.take() {
            if self.handler.is_some() {
                self.remaining = Some(deadline.saturating_duration_since(now));
            }
        }
        self.key.take()
    }

    /// Un-park: yields `(generation, new deadline)` to reschedule with.
    pub(crate) fn unpause(&mut self, now: Instant) -> Option<(u64, Instant)> {
        let remaining = self.remaining.take()?;
        if self.handler.is_none() {
            return None;
        }
        let deadline = now + remaining;
        self.deadline = Some(deadline);
        Some((self.generation, deadline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_is_discarded() {
        let mut slot = TimerSlot::new();
        let g1 = slot.arm(Instant::now(), Box::new(|| {}));
        slot.cancel();
        assert!(slot.take_fired(g1).is_none());
        let g2 = slot.arm(Instant::now(), Box::new(|| {}));
        assert_ne!(g1, g2);
        assert!(slot.take_fired(g2).is_some());
        assert!(!slot.is_armed());
    }

    #[test]
    fn pause_preserves_remaining_time() {
        let mut slot = TimerSlot::new();
        let now = Instant::now();
        let gen = slot.arm(now + Duration::from_millis(100), Box::new(|| {}));
        slot.pause(now + Duration::from_millis(40));
        let (resumed_gen, deadline) = slot.unpause(now + Duration::from_millis(50)).unwrap();
        assert_eq!(resumed_gen, gen);
        let left = deadline.saturating_duration_since(now + Duration::from_millis(50));
        assert!(left >= Duration::from_millis(55) && left <= Duration::from_millis(65));
    }

    #[test]
    fn expiry_while_paused_refires_on_resume() {
        let mut slot = TimerSlot::new();
        let now = Instant::now();
        let gen = slot.arm(now, Box::new(|| {}));
        slot.pause(now);
        slot.defer_fired(gen);
        let (_, deadline) = slot.unpause(now).unwrap();
        assert!(deadline <= Instant::now());
        assert!(slot.take_fired(gen).is_some());
    }
}
