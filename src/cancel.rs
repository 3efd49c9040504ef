//! Cancellation for calls into external services.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{RagError, Result};

/// Cloneable cancellation token.
///
/// Cancelling any clone wakes every pending [`CancelToken::run`], which drops the wrapped
/// future and with it any in-flight HTTP request.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: std::sync::Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        CancelToken {
            sender: std::sync::Arc::new(sender),
            receiver,
        }
    }

    /// Signal cancellation to every clone of this token
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any token clone, so this only ends on cancel
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `future` until it completes, the token is cancelled, or `timeout` elapses.
    ///
    /// `on_timeout` builds the error returned when the deadline is hit, so embedding and
    /// generation calls can report timeouts in their own error kind.
    pub async fn run<T, F, E>(&self, timeout: Duration, future: F, on_timeout: E) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        E: FnOnce() -> RagError,
    {
        if self.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        tokio::select! {
            _ = self.cancelled() => Err(RagError::Cancelled),
            outcome = tokio::time::timeout(timeout, future) => match outcome {
                Ok(result) => result,
                Err(_) => Err(on_timeout()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let token = CancelToken::new();
        let value = token
            .run(Duration::from_secs(1), async { Ok(7) }, || {
                RagError::Generation("timeout".into())
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_call() {
        let token = CancelToken::new();
        let clone = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            clone.cancel();
        });

        let result: Result<()> = token
            .run(
                Duration::from_secs(30),
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
                || RagError::Generation("timeout".into()),
            )
            .await;
        assert!(matches!(result, Err(RagError::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout_uses_caller_error() {
        let token = CancelToken::new();
        let result: Result<()> = token
            .run(
                Duration::from_millis(10),
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                || RagError::transient_embedding("timed out"),
            )
            .await;
        assert!(result.unwrap_err().is_transient());
    }
}
