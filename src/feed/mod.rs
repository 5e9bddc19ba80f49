//! Cloud feed that receives the occupancy count every feed tick.
//!
//! The engine hands values to a [`FeedSink`]. In production that is a
//! [`FeedPublisher`], which performs the HTTP push on a worker thread so a
//! slow cloud call never stalls the sensor loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

pub mod adafruit;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed service unreachable: {0}")]
    Transport(String),
    #[error("feed service returned http status {0}")]
    Http(u16),
    #[error("missing feed credential {0}")]
    MissingCredentials(String),
}

/// Blocking client for the cloud feed service.
pub trait FeedClient: Send {
    fn send_data(&self, feed_key: &str, value: u16) -> Result<(), FeedError>;
}

/// Where the engine publishes occupancy. Publishing never fails from the
/// caller's point of view; delivery problems are logged.
pub trait FeedSink {
    fn publish(&mut self, feed_key: &str, value: u16);
}

struct FeedUpdate {
    feed_key: String,
    value: u16,
}

/// Pushes feed updates from a background worker.
///
/// At most one update waits behind the one being sent; anything published
/// while that slot is taken is dropped.
pub struct FeedPublisher {
    sender: Option<SyncSender<FeedUpdate>>,
    worker: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl FeedPublisher {
    pub fn spawn<C>(client: C) -> Self
    where
        C: FeedClient + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel::<FeedUpdate>(1);
        let worker = std::thread::spawn(move || {
            for update in receiver {
                match client.send_data(&update.feed_key, update.value) {
                    Ok(()) => {
                        debug!(feed_key = %update.feed_key, value = update.value, "Pushed occupancy to feed");
                    }
                    Err(err) => {
                        warn!(feed_key = %update.feed_key, error = %err, "Failed to push occupancy to feed");
                    }
                }
            }
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of updates discarded because the worker was busy or gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FeedSink for FeedPublisher {
    fn publish(&mut self, feed_key: &str, value: u16) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        let update = FeedUpdate {
            feed_key: feed_key.to_string(),
            value,
        };
        match sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(feed_key = %feed_key, value, "Previous feed update still in flight, dropping value");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(feed_key = %feed_key, value, "Feed worker stopped, dropping value");
            }
        }
    }
}

impl Drop for FeedPublisher {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Feed worker panicked");
        }
    }
}

/// Sink used when no feed credentials are configured.
#[derive(Debug, Default)]
pub struct DisabledFeed;

impl FeedSink for DisabledFeed {
    fn publish(&mut self, feed_key: &str, value: u16) {
        debug!(feed_key = %feed_key, value, "Feed disabled, not publishing");
    }
}

/// In-memory feed for tests; usable directly as a sink or behind a
/// [`FeedPublisher`] as a client.
#[derive(Debug, Clone, Default)]
pub struct RecordingFeed {
    published: Arc<Mutex<Vec<(String, u16)>>>,
}

impl RecordingFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, u16)> {
        match self.published.lock() {
            Ok(published) => published.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, feed_key: &str, value: u16) {
        if let Ok(mut published) = self.published.lock() {
            published.push((feed_key.to_string(), value));
        }
    }
}

impl FeedSink for RecordingFeed {
    fn publish(&mut self, feed_key: &str, value: u16) {
        self.record(feed_key, value);
    }
}

impl FeedClient for RecordingFeed {
    fn send_data(&self, feed_key: &str, value: u16) -> Result<(), FeedError> {
        self.record(feed_key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender};

    struct GatedClient {
        started: Sender<u16>,
        release: Mutex<Receiver<()>>,
        inner: RecordingFeed,
    }

    impl FeedClient for GatedClient {
        fn send_data(&self, feed_key: &str, value: u16) -> Result<(), FeedError> {
            let _ = self.started.send(value);
            if let Ok(release) = self.release.lock() {
                let _ = release.recv();
            }
            self.inner.send_data(feed_key, value)
        }
    }

    struct FailingClient;

    impl FeedClient for FailingClient {
        fn send_data(&self, _feed_key: &str, _value: u16) -> Result<(), FeedError> {
            Err(FeedError::Http(503))
        }
    }

    #[test]
    fn publisher_delivers_through_client() {
        let recording = RecordingFeed::new();
        let mut publisher = FeedPublisher::spawn(recording.clone());

        publisher.publish("lobby", 12);
        drop(publisher);

        assert_eq!(recording.published(), vec![("lobby".to_string(), 12)]);
    }

    #[test]
    fn publisher_drops_values_while_busy() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let recording = RecordingFeed::new();
        let mut publisher = FeedPublisher::spawn(GatedClient {
            started: started_tx,
            release: Mutex::new(release_rx),
            inner: recording.clone(),
        });

        publisher.publish("lobby", 1);
        assert_eq!(started_rx.recv().ok(), Some(1));
        publisher.publish("lobby", 2);
        publisher.publish("lobby", 3);
        assert_eq!(publisher.dropped(), 1);

        let _ = release_tx.send(());
        let _ = release_tx.send(());
        drop(publisher);

        assert_eq!(
            recording.published(),
            vec![("lobby".to_string(), 1), ("lobby".to_string(), 2)]
        );
    }

    #[test]
    fn client_failures_do_not_stop_the_worker() {
        let mut publisher = FeedPublisher::spawn(FailingClient);

        publisher.publish("lobby", 1);
        drop(publisher);
    }
}
