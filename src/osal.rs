//! OS Abstraction Layer (OSAL) — spec.md §5.
//!
//! Everything above this module (event loop, client response wait) is
//! written against the [`Osal`] trait so it works unmodified on a bare
//! super-loop or under a preemptive RTOS/`std` thread. Two reference
//! backends are provided: [`SuperloopOsal`] (no OS, cooperative polling)
//! and [`PreemptiveOsal`] (blocks a real OS thread, `std`-only).

/// A binary semaphore plus the two other primitives the core needs from an
/// RTOS or bare-metal scheduler: a short critical section, and (for
/// cooperative scheduling) a way to make progress while waiting.
pub trait Osal {
    /// Gives (signals) the semaphore. Safe to call from ISR context.
    fn give(&self);

    /// Non-blocking check: takes the semaphore if it is currently given.
    /// Returns `true` if it was taken.
    fn try_take(&self) -> bool;

    /// Runs `f` with interrupts/preemption disabled for its duration. Used
    /// to guard the handful of places the event queue and per-channel state
    /// are touched from both task and ISR context (spec.md §5).
    fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R;

    /// Waits for [`Osal::give`] or for `timeout_ticks` (20 kHz ticks, per
    /// [`crate::timing`]) to elapse, whichever comes first. `now` reads the
    /// current tick count; `pump` is called between polls so a cooperative
    /// backend with no separate event task can still make progress.
    ///
    /// The default implementation busy-polls and calls `pump` every
    /// iteration — right for [`SuperloopOsal`]. A backend with real OS
    /// blocking (e.g. [`PreemptiveOsal`]) overrides this to block instead,
    /// relying on some other task to drive `pump`'s equivalent and call
    /// `give` directly.
    fn wait(&self, timeout_ticks: u16, now: &dyn Fn() -> u16, mut pump: impl FnMut()) -> bool {
        let start = now();
        loop {
            if self.try_take() {
                return true;
            }
            if crate::timing::elapsed(now(), start) >= timeout_ticks {
                return false;
            }
            pump();
        }
    }
}

/// Cooperative OSAL for a bare super-loop with no RTOS. `try_take` is the
/// only wait primitive; callers that need to block re-enter the event loop
/// themselves between polls (spec.md §4.3's "loop calling eventTask until
/// the semaphore is given or the timeout elapses").
#[derive(Debug, Default)]
pub struct SuperloopOsal {
    given: core::cell::Cell<bool>,
}

impl SuperloopOsal {
    pub const fn new() -> Self {
        Self {
            given: core::cell::Cell::new(false),
        }
    }
}

impl Osal for SuperloopOsal {
    fn give(&self) {
        self.given.set(true);
    }

    fn try_take(&self) -> bool {
        if self.given.get() {
            self.given.set(false);
            true
        } else {
            false
        }
    }

    fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R {
        // Single-threaded cooperative scheduling: nothing preempts us
        // between statements, so there is nothing to disable.
        f()
    }
}

/// `std`-backed OSAL for the preemptive scheduling model: a real condition
/// variable blocks the waiting thread instead of busy-polling.
#[cfg(feature = "std")]
#[derive(Debug, Default)]
pub struct PreemptiveOsal {
    state: std::sync::Mutex<bool>,
    condvar: std::sync::Condvar,
}

#[cfg(feature = "std")]
impl PreemptiveOsal {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(false),
            condvar: std::sync::Condvar::new(),
        }
    }

    /// Blocks the calling thread until given or `timeout` elapses. Returns
    /// `true` if the semaphore was given.
    pub fn take_timeout(&self, timeout: std::time::Duration) -> bool {
        let guard = self.state.lock().unwrap();
        let (mut guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |given| !*given)
            .unwrap();
        let was_given = *guard;
        *guard = false;
        was_given
    }
}

#[cfg(feature = "std")]
impl Osal for PreemptiveOsal {
    fn give(&self) {
        let mut guard = self.state.lock().unwrap();
        *guard = true;
        self.condvar.notify_one();
    }

    fn try_take(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        if *guard {
            *guard = false;
            true
        } else {
            false
        }
    }

    fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.state.lock().unwrap();
        f()
    }

    fn wait(&self, timeout_ticks: u16, _now: &dyn Fn() -> u16, _pump: impl FnMut()) -> bool {
        // A dedicated event task is assumed to be driving progress and
        // calling `give` directly; block for real instead of busy-polling.
        let micros_per_tick = 1_000_000 / crate::timing::TICKS_PER_SECOND as u64;
        let timeout = std::time::Duration::from_micros(timeout_ticks as u64 * micros_per_tick);
        self.take_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superloop_osal_give_then_try_take() {
        let osal = SuperloopOsal::new();
        assert!(!osal.try_take());
        osal.give();
        assert!(osal.try_take());
        assert!(!osal.try_take());
    }

    #[cfg(feature = "std")]
    #[test]
    fn preemptive_osal_blocks_until_given() {
        use std::sync::Arc;
        use std::time::Duration;

        let osal = Arc::new(PreemptiveOsal::new());
        let waiter = osal.clone();
        let handle = std::thread::spawn(move || waiter.take_timeout(Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(20));
        osal.give();
        assert!(handle.join().unwrap());
    }

    #[cfg(feature = "std")]
    #[test]
    fn preemptive_osal_times_out() {
        use std::time::Duration;
        let osal = PreemptiveOsal::new();
        assert!(!osal.take_timeout(Duration::from_millis(10)));
    }
}
