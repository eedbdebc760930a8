use std::future;
use std::sync::Arc;
use tokio::sync::watch;

/// Caller-side switch that cancels a request
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal observed by the router and the handler
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// Create a linked handle/signal pair
    pub fn new() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx: Arc::new(tx) },
            Cancellation { rx: Some(rx) },
        )
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once cancellation is requested.
    ///
    /// Pends forever if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return future::pending().await;
        };

        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            future::pending::<()>().await;
        }
    }
}
