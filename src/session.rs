// src/session.rs

use tokio_util::sync::CancellationToken;

/// Signals shared by every worker of one download attempt.
///
/// `stop` is requested by the caller, `error` is raised by any worker that
/// fails. Both only ever go from unset to set.
#[derive(Debug, Clone, Default)]
pub struct Session {
    stop: CancellationToken,
    error: CancellationToken,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session sharing this one's stop signal but with a fresh error signal.
    /// Used to start a retry after a failed attempt.
    pub fn retry(&self) -> Self {
        Self {
            stop: self.stop.clone(),
            error: CancellationToken::new(),
        }
    }

    /// Requests cooperative cancellation. Safe to call repeatedly and from any task.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Records that a worker failed.
    pub fn fail(&self) {
        self.error.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_cancelled()
    }

    /// Whether workers should stop pulling data.
    pub fn is_interrupted(&self) -> bool {
        self.is_stopped() || self.is_failed()
    }

    /// Resolves once either signal is set.
    pub async fn interrupted(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.error.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signals_are_shared_between_clones() {
        let session = Session::new();
        let worker = session.clone();
        assert!(!worker.is_interrupted());

        session.fail();
        session.fail();
        assert!(worker.is_failed());
        assert!(!worker.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), worker.interrupted())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_keeps_stop_but_clears_error() {
        let session = Session::new();
        session.fail();
        let retry = session.retry();
        assert!(!retry.is_failed());

        session.stop();
        assert!(retry.is_stopped());
    }
}
