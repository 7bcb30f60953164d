//! Memoized asynchronous attributes.
//!
//! A [`Memo`] is a slot that is either unset, pending (its lock is held by the
//! caller running the computation) or resolved. Concurrent callers queue on the
//! lock and get the outcome of whoever got there first, so a computation runs at
//! most once per flight. Errors are handed to the callers that waited on the
//! failed flight and never stored beyond it: the next caller retries.

use std::{
    future::Future,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;

use crate::error::Error;

/// Error of a memoized computation
pub trait Failure: Clone {
    /// Whether callers that waited on the failed computation receive this error
    /// as well. Otherwise the next one of them starts its own attempt.
    fn is_shared(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct Memo<T, E = Error> {
    /// Held for the whole computation. Keeps the last failure and its flight
    /// number for the callers that were queued behind it.
    flight: Mutex<Option<(u64, E)>>,
    /// Number of failed flights so far
    failures: AtomicU64,
    value: RwLock<Option<T>>,
}

impl<T: Clone, E: Failure> Default for Memo<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Failure> Memo<T, E> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flight: Mutex::const_new(None),
            failures: AtomicU64::new(0),
            value: RwLock::new(None),
        }
    }

    /// A slot that starts out resolved, used when rehydrating persisted state
    #[must_use]
    pub const fn resolved(value: T) -> Self {
        Self {
            flight: Mutex::const_new(None),
            failures: AtomicU64::new(0),
            value: RwLock::new(Some(value)),
        }
    }

    fn store(&self, value: Option<T>) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Returns the cached value or runs `init` to produce it.
    ///
    /// Callers arriving while `init` is running wait for it instead of starting
    /// a second computation, and get its error if it fails. A failure is not
    /// kept for later callers. A dropped `init` future leaves the slot unset and
    /// lets the next waiter start over.
    ///
    /// # Errors
    /// Whatever `init` returns, or the error of the flight this call joined
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_try_compute(init).await.map(|(value, _)| value)
    }

    /// Same as [`Memo::get_or_try_init`], also telling whether this call ran
    /// `init`. The value is already stored when this returns.
    ///
    /// # Errors
    /// Whatever `init` returns, or the error of the flight this call joined
    pub async fn get_or_try_compute<F, Fut>(&self, init: F) -> Result<(T, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.peek() {
            return Ok((value, false));
        }

        let joined = self.failures.load(Ordering::Acquire);
        let mut flight = self.flight.lock().await;
        if let Some(value) = self.peek() {
            return Ok((value, false));
        }
        if let Some((_, error)) = flight.as_ref().filter(|(n, _)| *n > joined) {
            return Err(error.clone());
        }

        match init().await {
            Ok(value) => {
                self.store(Some(value.clone()));
                *flight = None;
                Ok((value, true))
            }
            Err(error) => {
                *flight = error.is_shared().then(|| {
                    let n = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                    (n, error.clone())
                });
                Err(error)
            }
        }
    }

    /// Resolved value, if any. Never waits on a pending computation.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.flight.try_lock().is_err()
    }

    /// Drops the cached value, waiting for a pending computation first
    pub async fn invalidate(&self) {
        let mut flight = self.flight.lock().await;
        self.store(None);
        *flight = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use futures_util::future::join_all;
    use tokio::time::Instant;

    use super::*;

    impl Failure for () {}
    impl Failure for &'static str {}

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let memo = Arc::new(Memo::<u32, ()>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|_| {
            let memo = memo.clone();
            let calls = calls.clone();
            async move {
                memo.get_or_try_init(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(42)
                })
                .await
            }
        });

        let results = join_all(callers).await;
        assert!(results.iter().all(|r| *r == Ok(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.peek(), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let memo = Arc::new(Memo::<u32, &str>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let callers = (0..8).map(|_| {
            let memo = memo.clone();
            let calls = calls.clone();
            async move {
                memo.get_or_try_init(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err("site is down")
                })
                .await
            }
        });

        let results = join_all(callers).await;
        assert!(results.iter().all(|r| *r == Err("site is down")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(100));

        // Settled failures aren't kept for whoever comes next
        let retried = memo.get_or_try_init(|| async { Ok(7) }).await;
        assert_eq!(retried, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Lookup {
        Cancelled,
        Down,
    }

    impl Failure for Lookup {
        fn is_shared(&self) -> bool {
            *self != Self::Cancelled
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unshared_failure_lets_waiters_retry() {
        let memo = Memo::<u32, Lookup>::new();

        let leader = memo.get_or_try_init(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(Lookup::Cancelled)
        });
        let waiter = memo.get_or_try_init(|| async { Ok(3) });

        let (leader, waiter) = tokio::join!(leader, waiter);
        assert_eq!(leader, Err(Lookup::Cancelled));
        assert_eq!(waiter, Ok(3));

        let memo = Memo::<u32, Lookup>::new();
        let down = memo.get_or_try_init(|| async { Err(Lookup::Down) }).await;
        assert_eq!(down, Err(Lookup::Down));
        assert_eq!(memo.get_or_try_init(|| async { Ok(4) }).await, Ok(4));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let memo = Memo::<String, &str>::new();

        let first = memo.get_or_try_init(|| async { Err("boom") }).await;
        assert_eq!(first, Err("boom"));
        assert_eq!(memo.peek(), None);

        let second = memo
            .get_or_try_init(|| async { Ok("ok".to_string()) })
            .await;
        assert_eq!(second.as_deref(), Ok("ok"));
    }

    #[tokio::test]
    async fn dropped_computation_leaves_slot_unset() {
        let memo = Memo::<u8, ()>::new();

        let pending = memo.get_or_try_init(|| async {
            std::future::pending::<()>().await;
            Ok(1)
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert!(!memo.is_pending());
        assert_eq!(memo.peek(), None);
        assert_eq!(memo.get_or_try_init(|| async { Ok(2) }).await, Ok(2));
    }

    #[tokio::test]
    async fn resolved_value_is_visible_during_a_flight() {
        let memo = Memo::<u8, ()>::resolved(5);
        let _flight = memo.flight.lock().await;

        assert!(memo.is_pending());
        assert_eq!(memo.peek(), Some(5));
    }

    #[tokio::test]
    async fn invalidate_forgets_value() {
        let memo = Memo::<i64, ()>::resolved(7);
        assert_eq!(memo.peek(), Some(7));

        memo.invalidate().await;
        assert_eq!(memo.peek(), None);

        let recomputed = memo.get_or_try_init(|| async { Ok(9) }).await;
        assert_eq!(recomputed, Ok(9));
    }
}
