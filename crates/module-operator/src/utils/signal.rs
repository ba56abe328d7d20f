use std::future::Future;

use futures::{channel::oneshot, FutureExt};
use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to construct signal watcher"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Watches for `SIGTERM` or `SIGINT` and multiplies it by sending it to all acquired handles.
pub struct SignalWatcher {
    watch_rx: watch::Receiver<bool>,
}

impl SignalWatcher {
    /// Watches the provided `signal` and multiplies the signal by sending it to all acquired
    /// handles.
    pub fn new<F>(signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (watch_tx, watch_rx) = watch::channel(false);

        tokio::spawn(async move {
            signal.await;
            watch_tx.send_replace(true);
        });

        Self { watch_rx }
    }

    /// Watches `SIGTERM` and `SIGINT`.
    pub fn terminate() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;

        Ok(Self::new(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
            }
        }))
    }

    /// Acquire a new handle which completes once the signal was received.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle(&self) -> impl Future<Output = ()> + Send + Sync + 'static {
        let (tx, rx) = oneshot::channel();
        let token = self.token();

        tokio::spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        });

        rx.map(|_| ())
    }

    /// Acquire a token that can be polled for cancellation.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            watch_rx: Some(self.watch_rx.clone()),
        }
    }
}

/// Cancellation signal handed to every reconcile.
///
/// It can be cheaply cloned to be able to gracefully shutdown multiple concurrent tasks.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    watch_rx: Option<watch::Receiver<bool>>,
}

impl ShutdownToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self::default()
    }

    /// A token together with the function that cancels it.
    pub fn manual() -> (ShutdownTrigger, Self) {
        let (watch_tx, watch_rx) = watch::channel(false);
        (ShutdownTrigger { watch_tx }, Self {
            watch_rx: Some(watch_rx),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.watch_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Completes once the token is cancelled. Never completes for [`ShutdownToken::never`].
    pub async fn cancelled(&self) {
        self.clone().cancelled_owned().await;
    }

    async fn cancelled_owned(self) {
        match self.watch_rx {
            Some(mut rx) => {
                let cancelled = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
                // A dropped sender can no longer cancel
                if cancelled.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

pub struct ShutdownTrigger {
    watch_tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn cancel(&self) {
        self.watch_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn manual_token_cancels() {
        let (trigger, token) = ShutdownToken::manual();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        trigger.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancellation must wake waiters")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn never_token_is_not_cancelled() {
        let token = ShutdownToken::never();
        assert!(!token.is_cancelled());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), token.cancelled())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn watcher_handles_complete_after_signal() {
        let (trigger, token) = ShutdownToken::manual();
        let watcher = SignalWatcher::new(async move { token.cancelled().await });
        let handle = watcher.handle();
        let watcher_token = watcher.token();

        trigger.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("handle must complete");
        assert!(watcher_token.is_cancelled());
    }
}
