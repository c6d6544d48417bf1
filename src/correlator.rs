//! Request/response correlation.
//!
//! Turns "send a message, wait for the reply carrying the same id" into a
//! single awaitable call with a timeout. The correlator knows nothing about
//! connections: the caller supplies the send action and feeds every inbound
//! payload to [`Correlator::notify_result`].
//!
//! Each pending id owns a oneshot sender, so a result is delivered at most once
//! and a late notification after a timeout simply finds no entry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

struct Pending<T> {
    /// Distinguishes registrations that reuse an id after a reset.
    token: u64,
    tx: oneshot::Sender<T>,
}

/// Registry of in-flight requests keyed by correlation id.
pub struct Correlator<T> {
    pending: Mutex<HashMap<String, Pending<T>>>,
    next_token: AtomicU64,
}

impl<T: Send> Correlator<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Pending<T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id`, run `send`, and wait up to `timeout` for the result.
    ///
    /// Returns `None` without calling `send` if `id` is already pending,
    /// `None` if `send` reports failure, and `None` on timeout. The id is
    /// deregistered on every exit path, including cancellation of the
    /// returned future.
    pub async fn execute_and_wait<F, Fut>(&self, id: &str, timeout: Duration, send: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let registered = match self.slots().entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Pending { token, tx });
                true
            }
        };
        if !registered {
            warn!(correlation_id = id, "correlation id already pending");
            return None;
        }
        let _registration = Registration {
            correlator: self,
            id,
            token,
        };

        if !send().await {
            debug!(correlation_id = id, "send failed, not waiting for result");
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => {
                debug!(correlation_id = id, "pending request cancelled");
                None
            }
            Err(_) => {
                debug!(correlation_id = id, ?timeout, "timed out waiting for result");
                None
            }
        }
    }

    /// Deliver `result` to the caller waiting on `id`.
    ///
    /// Returns false if nobody is waiting, which is the normal case for
    /// unsolicited traffic.
    pub fn notify_result(&self, id: &str, result: T) -> bool {
        let pending = self.slots().remove(id);
        match pending {
            Some(pending) => pending.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Number of requests currently waiting for a result.
    pub fn active_count(&self) -> usize {
        self.slots().len()
    }

    /// Drop every pending request; their callers resolve to `None`.
    pub fn reset(&self) {
        let dropped = std::mem::take(&mut *self.slots());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "cancelled pending requests");
        }
    }

    fn deregister(&self, id: &str, token: u64) {
        let mut slots = self.slots();
        if slots.get(id).is_some_and(|p| p.token == token) {
            slots.remove(id);
        }
    }
}

impl<T: Send> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a registration when the waiting call ends, however it ends.
struct Registration<'a, T: Send> {
    correlator: &'a Correlator<T>,
    id: &'a str,
    token: u64,
}

impl<T: Send> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        self.correlator.deregister(self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_result_delivered() {
        let correlator = Arc::new(Correlator::<String>::new());
        let notifier = correlator.clone();

        let result = correlator
            .execute_and_wait("req-1", Duration::from_secs(5), || async move {
                tokio::spawn(async move {
                    notifier.notify_result("req-1", "reply".to_string());
                });
                true
            })
            .await;

        assert_eq!(result.as_deref(), Some("reply"));
        assert_eq!(correlator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_notify() {
        let correlator = Correlator::<String>::new();
        let started = Instant::now();

        let result = correlator
            .execute_and_wait("late", Duration::from_millis(10), || async { true })
            .await;

        let elapsed = started.elapsed();
        assert!(result.is_none());
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(2));
        assert!(!correlator.notify_result("late", "too late".to_string()));
        assert_eq!(correlator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_returns_none() {
        let correlator = Correlator::<String>::new();

        let result = correlator
            .execute_and_wait("fail", Duration::from_secs(5), || async { false })
            .await;

        assert!(result.is_none());
        assert_eq!(correlator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_send() {
        let correlator = Arc::new(Correlator::<String>::new());
        let first = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .execute_and_wait("dup", Duration::from_secs(5), || async { true })
                    .await
            })
        };
        while correlator.active_count() == 0 {
            tokio::task::yield_now().await;
        }

        let invoked = AtomicBool::new(false);
        let flag = &invoked;
        let second = correlator
            .execute_and_wait("dup", Duration::from_secs(5), || async move {
                flag.store(true, Ordering::SeqCst);
                true
            })
            .await;

        assert!(second.is_none());
        assert!(!invoked.load(Ordering::SeqCst));

        assert!(correlator.notify_result("dup", "first".to_string()));
        assert_eq!(first.await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_notify_unknown_id() {
        let correlator = Correlator::<u32>::new();
        assert!(!correlator.notify_result("nobody", 1));
    }

    #[tokio::test]
    async fn test_parallel_requests() {
        let correlator = Arc::new(Correlator::<String>::new());
        let mut tasks = Vec::new();

        for i in 0..100 {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                let id = i.to_string();
                let notifier = correlator.clone();
                let reply_id = id.clone();
                let result = correlator
                    .execute_and_wait(&id, Duration::from_secs(5), || async move {
                        tokio::spawn(async move {
                            let reversed: String = reply_id.chars().rev().collect();
                            notifier.notify_result(&reply_id, reversed);
                        });
                        true
                    })
                    .await;
                (id, result)
            }));
        }

        for task in tasks {
            let (id, result) = task.await.unwrap();
            let expected: String = id.chars().rev().collect();
            assert_eq!(result, Some(expected));
        }
        assert_eq!(correlator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_cancels_waiters() {
        let correlator = Arc::new(Correlator::<String>::new());
        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .execute_and_wait("pending", Duration::from_secs(5), || async { true })
                    .await
            })
        };
        while correlator.active_count() == 0 {
            tokio::task::yield_now().await;
        }

        correlator.reset();

        assert!(waiter.await.unwrap().is_none());
        assert_eq!(correlator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_deregisters() {
        let correlator = Correlator::<String>::new();

        let wait = correlator.execute_and_wait("gone", Duration::from_secs(5), || async { true });
        let _ = tokio::time::timeout(Duration::from_millis(10), wait).await;

        assert_eq!(correlator.active_count(), 0);
    }
}
