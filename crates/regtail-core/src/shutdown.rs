//! Cooperative cancellation shared by every fetch loop.
//!
//! One [`ShutdownTrigger`] fans out to any number of [`Shutdown`] listeners.
//! Once raised the signal stays raised.

use tokio::sync::watch;

/// Raises the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Observes the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Option<watch::Receiver<bool>>,
}

/// Create a connected trigger/listener pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx: Some(rx) })
}

impl ShutdownTrigger {
    /// Raise the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// New listener bound to this trigger.
    #[must_use]
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Shutdown {
    /// A listener that never fires, for one-off calls and tests.
    #[must_use]
    pub fn never() -> Self {
        Self { rx: None }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the signal is raised. Pends forever if every trigger
    /// was dropped without raising it.
    pub async fn wait(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        if rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
