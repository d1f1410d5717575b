//! Shutdown coordination for the wallet daemon.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Long-running tasks hold a clone of the token and stop when it fires;
/// the drain phase is bounded by `grace`.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    grace: Duration,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once shutdown begins.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Run the drain phase, giving up after the grace period.
    ///
    /// Returns false if the deadline was hit.
    pub async fn drain<F: Future<Output = ()>>(&self, drain: F) -> bool {
        match tokio::time::timeout(self.grace, drain).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(grace_secs = self.grace.as_secs(), "Drain deadline exceeded, forcing exit");
                false
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let shutdown = Shutdown::default();
        let token = shutdown.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_deadline() {
        let shutdown = Shutdown::new(Duration::from_secs(1));
        assert!(shutdown.drain(async {}).await);
        assert!(!shutdown.drain(tokio::time::sleep(Duration::from_secs(5))).await);
    }
}
