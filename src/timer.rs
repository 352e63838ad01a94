//! # Timer Wheel
//!
//! A hashed timer wheel ticking every 40 ms, driven by a dedicated
//! background thread. Used for outbound heartbeats, inbound liveness checks,
//! per-message global deadlines, and batched-ACK flushes.
//!
//! Tasks are plain closures; cancellation flips an atomic flag consulted
//! right before the task runs, so `cancel` racing a firing tick is safe and
//! idempotent — at most one of "task ran" or "task was cancelled" happens,
//! never both.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TICK_DURATION: Duration = Duration::from_millis(40);

const WHEEL_SLOTS: usize = 512;

type Task = Box<dyn FnOnce() + Send>;

struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    /// Number of additional full wheel revolutions before this task is due.
    rounds_remaining: u64,
    task: Task,
}

/// Opaque handle returned by [`TimerWheel::schedule`]; pass to
/// [`TimerWheel::cancel`] to cancel.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

struct Inner {
    slots: Vec<Vec<ScheduledTask>>,
    current_slot: usize,
}

/// A hashed timer wheel with a background ticking thread.
///
/// Cheap to clone: every clone shares the same slots and ticking thread via
/// the inner `Arc`s, so a clone handed to a message or connection can cancel
/// tasks scheduled through any other clone.
///
/// Dropping the last clone of the wheel stops the ticking thread on its next
/// tick boundary.
#[derive(Clone)]
pub struct TimerWheel {
    inner: Arc<Mutex<Inner>>,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
}

impl TimerWheel {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
            current_slot: 0,
        }));
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));

        let thread_inner = inner.clone();
        let thread_running = running.clone();
        let thread_ticks = ticks.clone();
        std::thread::Builder::new()
            .name("timer-wheel".into())
            .spawn(move || Self::run(thread_inner, thread_running, thread_ticks))
            .expect("failed to spawn timer wheel thread");

        TimerWheel {
            inner,
            running,
            ticks,
        }
    }

    fn run(inner: Arc<Mutex<Inner>>, running: Arc<AtomicBool>, ticks: Arc<AtomicU64>) {
        while running.load(Ordering::Acquire) {
            std::thread::sleep(TICK_DURATION);
            ticks.fetch_add(1, Ordering::Relaxed);

            let due = {
                let mut guard = inner.lock().unwrap();
                let slot = guard.current_slot;
                let mut due = Vec::new();
                let mut still_pending = Vec::new();
                for mut entry in guard.slots[slot].drain(..) {
                    if entry.rounds_remaining == 0 {
                        due.push(entry);
                    } else {
                        entry.rounds_remaining -= 1;
                        still_pending.push(entry);
                    }
                }
                guard.slots[slot] = still_pending;
                guard.current_slot = (slot + 1) % WHEEL_SLOTS;
                due
            };

            for entry in due {
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                // Guard against a panicking task bringing down the timer
                // thread; the task boundary is the containment point.
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry.task));
            }
        }
    }

    /// Schedule `task` to run after `delay`. `task` MUST be idempotent under
    /// re-entry — in practice this means it should consult registry state by
    /// id rather than close over owned state that a racing cancel might also
    /// touch.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let delay_ticks = (delay.as_nanos() / TICK_DURATION.as_nanos()).max(1) as u64;
        let rounds_remaining = delay_ticks / WHEEL_SLOTS as u64;
        let slot_offset = (delay_ticks % WHEEL_SLOTS as u64) as usize;

        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = ScheduledTask {
            cancelled: cancelled.clone(),
            rounds_remaining,
            task: Box::new(task),
        };

        let mut guard = self.inner.lock().unwrap();
        let target_slot = (guard.current_slot + slot_offset) % WHEEL_SLOTS;
        guard.slots[target_slot].push(entry);

        TimerHandle { cancelled }
    }

    /// Cancel a previously scheduled task. Safe to call more than once or
    /// after the task has already fired.
    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancelled.store(true, Ordering::Release);
    }

    #[cfg(test)]
    fn ticks_elapsed(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        // Only the last clone dropping should stop the ticking thread; the
        // Arc refcount on `running` (shared identically by every clone)
        // tells us whether any sibling handle is still alive.
        if Arc::strong_count(&self.running) == 1 {
            self.running.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn fires_after_delay() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();
        wheel.schedule(Duration::from_millis(80), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_millis(500))
            .expect("task should have fired");
    }

    #[test]
    fn cancel_before_fire_suppresses_task() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = wheel.schedule(Duration::from_millis(200), move || {
            tx.send(()).unwrap();
        });
        wheel.cancel(&handle);
        let result = rx.recv_timeout(Duration::from_millis(400));
        assert!(result.is_err(), "cancelled task must not fire");
    }

    #[test]
    fn cancel_is_idempotent() {
        let wheel = TimerWheel::new();
        let handle = wheel.schedule(Duration::from_millis(80), || {});
        wheel.cancel(&handle);
        wheel.cancel(&handle); // must not panic or double-fire anything
    }

    #[test]
    fn cancel_after_fire_is_a_harmless_no_op() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();
        let handle = wheel.schedule(Duration::from_millis(80), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_millis(500)).unwrap();
        wheel.cancel(&handle);
    }

    #[test]
    fn long_delay_spans_multiple_wheel_revolutions() {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        // WHEEL_SLOTS * TICK_DURATION ~= 20.5s; pick a delay beyond one
        // revolution to exercise rounds_remaining.
        let delay = TICK_DURATION * (WHEEL_SLOTS as u32 + 5);
        wheel.schedule(delay, move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(delay + Duration::from_secs(2))
            .expect("long-delay task should eventually fire");
        assert!(start.elapsed() >= delay);
    }
}
