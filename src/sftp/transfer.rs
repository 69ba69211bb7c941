//! Cancellation and outcome types for uploads

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Cancel handle for one transfer. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct TransferControl {
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Guard that cancels the transfer when dropped, unless disarmed first.
    /// Hold it across an await so dropping the future stops the blocking worker.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            control: Some(self.clone()),
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CancelOnDrop {
    control: Option<TransferControl>,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.control = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            tracing::debug!("Upload future dropped, cancelling transfer");
            control.cancel();
        }
    }
}

/// How an upload ended. Failures are errors; cancellation is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    Completed { bytes_sent: u64 },
    Cancelled { bytes_sent: u64 },
}

impl UploadOutcome {
    pub fn bytes_sent(&self) -> u64 {
        match self {
            UploadOutcome::Completed { bytes_sent } | UploadOutcome::Cancelled { bytes_sent } => *bytes_sent,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, UploadOutcome::Completed { .. })
    }
}
