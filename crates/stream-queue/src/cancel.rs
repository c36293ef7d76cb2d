//! Cooperative cancellation for consumer operations.

use crate::error::{BrokerError, BrokerResult};
use std::future::Future;
use tokio::sync::watch;

/// Fires the paired [`CancelSignal`]s.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Create a handle and its first signal.
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx: Some(rx) })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal tied to this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Observed by an operation; once fired, the operation stops waiting.
///
/// A command already written to the broker still executes there; only the
/// wait for its reply is abandoned.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped uncancelled.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };

        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Drive `operation` unless the signal fires first.
    pub async fn run<T, F>(&self, operation: F) -> BrokerResult<T>
    where
        F: Future<Output = BrokerResult<T>>,
    {
        if self.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(BrokerError::Cancelled),
            result = operation => result,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}
