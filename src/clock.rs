//! Monotonic time helpers and the interruptible deadline sleep used by the
//! send worker.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Microseconds elapsed from `origin` to `now`, truncated to the 32-bit
/// wire timestamp field. Wraps roughly every 71 minutes; consumers compare
/// timestamps only over windows far smaller than the wrap period.
pub fn timestamp_us(origin: Instant, now: Instant) -> u32 {
    now.duration_since(origin).as_micros() as u32
}

/// An interruptible absolute-deadline sleep.
///
/// The send worker parks here until the earliest scheduled send time; an
/// `interrupt()` (new earlier deadline, or shutdown) wakes it immediately.
pub struct DeadlineTimer {
    tick: Mutex<u64>,
    cond: Condvar,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        DeadlineTimer { tick: Mutex::new(0), cond: Condvar::new() }
    }

    /// Sleep until `deadline` or until interrupted, whichever comes first.
    pub fn sleep_until(&self, deadline: Instant) {
        let mut tick = self.tick.lock().unwrap();
        let entry = *tick;
        loop {
            let now = Instant::now();
            if now >= deadline || *tick != entry {
                return;
            }
            let (guard, _) = self.cond.wait_timeout(tick, deadline - now).unwrap();
            tick = guard;
        }
    }

    /// Wake every sleeper immediately.
    pub fn interrupt(&self) {
        let mut tick = self.tick.lock().unwrap();
        *tick = tick.wrapping_add(1);
        self.cond.notify_all();
    }
}

impl Default for DeadlineTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait helper: condvar wait with an optional overall deadline.
///
/// Returns false once `deadline` passes without `pred` becoming true.
pub fn wait_until<T, F>(
    lock: &Mutex<T>,
    cond: &Condvar,
    deadline: Option<Instant>,
    mut pred: F,
) -> bool
where
    F: FnMut(&mut T) -> bool,
{
    let mut guard = lock.lock().unwrap();
    loop {
        if pred(&mut guard) {
            return true;
        }
        match deadline {
            None => guard = cond.wait(guard).unwrap(),
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return false;
                }
                let (g, _) = cond.wait_timeout(guard, d - now).unwrap();
                guard = g;
            }
        }
    }
}

/// Deadline for a relative timeout, saturating for "no timeout".
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn timestamp_is_monotonic() {
        let origin = Instant::now();
        let a = timestamp_us(origin, origin + Duration::from_micros(150));
        let b = timestamp_us(origin, origin + Duration::from_micros(300));
        assert_eq!(a, 150);
        assert_eq!(b, 300);
    }

    #[test]
    fn sleep_until_past_deadline_returns_immediately() {
        let timer = DeadlineTimer::new();
        let started = Instant::now();
        timer.sleep_until(started);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn interrupt_wakes_sleeper() {
        let timer = Arc::new(DeadlineTimer::new());
        let t2 = timer.clone();
        let h = thread::spawn(move || {
            let started = Instant::now();
            t2.sleep_until(started + Duration::from_secs(10));
            started.elapsed()
        });
        thread::sleep(Duration::from_millis(50));
        timer.interrupt();
        let slept = h.join().unwrap();
        assert!(slept < Duration::from_secs(5));
    }

    #[test]
    fn wait_until_times_out() {
        let lock = Mutex::new(0u32);
        let cond = Condvar::new();
        let ok = wait_until(
            &lock,
            &cond,
            Some(Instant::now() + Duration::from_millis(30)),
            |v| *v == 1,
        );
        assert!(!ok);
    }
}
