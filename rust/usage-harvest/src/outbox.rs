//! After-commit wake-up requests for endpoint workers.
//!
//! Planning code buffers "please run endpoint X" notifications in a
//! [`WakeOutbox`] and flushes them only once the intentions it created are
//! durably visible, so a woken worker never races ahead of the insert.

use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tracing::debug;

/// Receiver of endpoint wake-up requests.
pub trait WakeSink: Send + Sync {
    /// Ask for a worker on `url`. Must not block; delivery is best effort.
    fn wake(&self, url: &str);
}

/// Discards wake-ups; endpoints are then only picked up by the periodic tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWake;

impl WakeSink for NullWake {
    fn wake(&self, _url: &str) {}
}

impl WakeSink for mpsc::UnboundedSender<String> {
    fn wake(&self, url: &str) {
        if self.send(url.to_string()).is_err() {
            debug!(url, "Wake channel closed, endpoint left to the periodic tick");
        }
    }
}

/// Deduplicated set of endpoints to wake after a commit.
#[derive(Debug, Default)]
pub struct WakeOutbox {
    pending: BTreeSet<String>,
}

impl WakeOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a wake-up for `url`; repeated URLs are sent once.
    pub fn defer(&mut self, url: impl Into<String>) {
        self.pending.insert(url.into());
    }

    /// Deliver every buffered wake-up. Returns how many were sent.
    pub fn flush(self, sink: &dyn WakeSink) -> usize {
        let count = self.pending.len();
        for url in self.pending {
            sink.wake(&url);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flush_deduplicates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outbox = WakeOutbox::new();
        outbox.defer("https://b.example.com");
        outbox.defer("https://a.example.com");
        outbox.defer("https://b.example.com");

        assert_eq!(outbox.flush(&tx), 2);
        assert_eq!(rx.recv().await.unwrap(), "https://a.example.com");
        assert_eq!(rx.recv().await.unwrap(), "https://b.example.com");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(rx);
        let mut outbox = WakeOutbox::new();
        outbox.defer("https://a.example.com");
        assert_eq!(outbox.flush(&tx), 1);
    }
}
