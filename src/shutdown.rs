//! Cooperative close signal for connection and accept-loop tasks.
//!
//! A `Shutdown` can be cloned and shared across tasks. Closing any clone wakes
//! every task awaiting [`Shutdown::closed`], which is how a read loop blocked
//! on the socket, the writer task and the accept loop learn to stop.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub(crate) struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request close. Returns true only for the call that flipped the signal.
    pub(crate) fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once close has been requested.
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only ends on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_close_once() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_closed());
        assert!(shutdown.close());
        assert!(!shutdown.close());
        assert!(shutdown.is_closed());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.closed().await })
        };

        tokio::task::yield_now().await;
        shutdown.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_after_close_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.close();
        tokio::time::timeout(Duration::from_millis(100), shutdown.closed())
            .await
            .unwrap();
    }
}
