//! Upload progress delivery.
//!
//! The transfer loop reports after every chunk; [`ProgressThrottle`] decides which
//! of those reach the caller. Callers that live on their own executor (a UI loop)
//! can take a [`progress_channel`] and read the latest value whenever they like.

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_sent as f64 / self.total_bytes as f64
    }
}

/// Forwards at most one update per interval. The first update and the final one
/// (`bytes_sent == total_bytes`) always pass.
pub struct ProgressThrottle<F> {
    callback: F,
    interval: Duration,
    last_emit: Option<Instant>,
    last_sent: Option<u64>,
}

impl<F> ProgressThrottle<F>
where
    F: FnMut(TransferProgress),
{
    pub fn new(interval: Duration, callback: F) -> Self {
        Self {
            callback,
            interval,
            last_emit: None,
            last_sent: None,
        }
    }

    pub fn report(&mut self, bytes_sent: u64, total_bytes: u64) {
        if self.last_sent == Some(bytes_sent) {
            return;
        }
        let done = bytes_sent >= total_bytes;
        let due = self.last_emit.map_or(true, |at| at.elapsed() >= self.interval);
        if !(done || due) {
            return;
        }

        self.last_emit = Some(Instant::now());
        self.last_sent = Some(bytes_sent);
        (self.callback)(TransferProgress { bytes_sent, total_bytes });
    }
}

/// A progress callback paired with a receiver holding the latest value
pub fn progress_channel() -> (
    impl FnMut(TransferProgress) + Send + 'static,
    watch::Receiver<TransferProgress>,
) {
    let (tx, rx) = watch::channel(TransferProgress::default());
    let sender = move |progress: TransferProgress| {
        tx.send_replace(progress);
    };
    (sender, rx)
}
