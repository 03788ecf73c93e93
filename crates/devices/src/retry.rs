//! Bounded retry and polling.
//!
//! Every wait in the drivers goes through a [`Sleeper`], so tests can use
//! [`NoSleep`] and long waits can be woken early through a [`CancelFlag`].

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Something that can block the current thread for a while.
pub trait Sleeper: Send + Sync {
    /// Sleep for `duration`. Returns `false` when the wait was cut short
    /// by cancellation.
    fn sleep(&self, duration: Duration) -> bool;

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Real sleeping via `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) -> bool {
        std::thread::sleep(duration);
        true
    }
}

/// Returns immediately. Used by tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) -> bool {
        true
    }
}

/// Cooperative cancellation shared between a running procedure and the
/// thread that may stop it. Sleeping on the flag wakes as soon as
/// [`CancelFlag::cancel`] is called.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut cancelled) = lock.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    /// Clear the flag before the next run.
    pub fn reset(&self) {
        let (lock, _) = &*self.inner;
        if let Ok(mut cancelled) = lock.lock() {
            *cancelled = false;
        }
    }
}

impl Sleeper for CancelFlag {
    fn sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let Ok(guard) = lock.lock() else {
            return false;
        };
        match cvar.wait_timeout_while(guard, duration, |cancelled| !*cancelled) {
            Ok((cancelled, _)) => !*cancelled,
            Err(_) => false,
        }
    }

    fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|c| *c).unwrap_or(true)
    }
}

/// How many times to try, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Multiplier applied to the interval after each failed attempt.
    pub backoff: f64,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: 1.0,
        }
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt as i32);
        self.interval.mul_f64(factor)
    }

    /// Run `op` until it succeeds or the attempts run out, returning the
    /// last error.
    pub fn retry<T, E>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, E> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => return Err(err),
                Err(_) => {
                    sleeper.sleep(self.delay(attempt));
                    attempt += 1;
                }
            }
        }
    }

    /// Call `probe` until it yields a value, sleeping between calls.
    /// Returns `None` once the attempts run out or the sleeper is cancelled.
    pub fn poll<T>(&self, sleeper: &dyn Sleeper, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        for attempt in 0..self.max_attempts.max(1) {
            if let Some(value) = probe() {
                return Some(value);
            }
            if attempt + 1 < self.max_attempts && !sleeper.sleep(self.delay(attempt)) {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recording(Mutex<Vec<Duration>>);

    impl Sleeper for Recording {
        fn sleep(&self, duration: Duration) -> bool {
            self.0.lock().unwrap().push(duration);
            true
        }
    }

    #[test]
    fn retry_stops_at_first_success() {
        let sleeper = Recording(Mutex::new(Vec::new()));
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        let result: Result<u32, &str> = policy.retry(&sleeper, |attempt| {
            if attempt == 1 {
                Ok(42)
            } else {
                Err("no reply")
            }
        });
        assert_eq!(result, Ok(42));
        assert_eq!(*sleeper.0.lock().unwrap(), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: Result<(), u32> = policy.retry(&NoSleep, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(attempt)
        });
        assert_eq!(result, Err(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_interval() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(100)).with_backoff(2.0);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn poll_is_bounded() {
        let sleeper = Recording(Mutex::new(Vec::new()));
        let policy = RetryPolicy::fixed(9, Duration::from_millis(100));
        let found: Option<()> = policy.poll(&sleeper, || None);
        assert!(found.is_none());
        assert_eq!(sleeper.0.lock().unwrap().len(), 8);
    }

    #[test]
    fn cancel_wakes_sleeper() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();
        let handle = std::thread::spawn(move || waiter.sleep(Duration::from_secs(30)));
        flag.cancel();
        assert!(!handle.join().unwrap());
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn cancelled_flag_stops_polling() {
        let flag = CancelFlag::new();
        flag.cancel();
        let policy = RetryPolicy::fixed(1000, Duration::from_secs(10));
        let mut probes = 0;
        let found: Option<()> = policy.poll(&flag, || {
            probes += 1;
            None
        });
        assert!(found.is_none());
        assert_eq!(probes, 1);
    }
}
