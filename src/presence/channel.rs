//! Ingestion channel: bounded FIFO from request handlers to the aggregator.
//!
//! Presence is best-effort telemetry. A full queue never stalls a request for
//! longer than the submit timeout; the envelope is dropped and counted instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use super::UpdateEnvelope;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_millis(50);
pub const MAX_CHANNEL_CAPACITY: usize = 1_000_000;

pub type IngestReceiver = mpsc::Receiver<UpdateEnvelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Queue was full and the caller asked not to wait.
    Full,
    /// Queue stayed full for the whole submit timeout.
    TimedOut,
    /// Aggregator is gone.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    Dropped(DropReason),
}

#[derive(Debug, Default)]
struct IngestCounters {
    queued: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub queued: u64,
    pub dropped: u64,
    pub queue_depth: usize,
    pub capacity: usize,
}

/// Producer half. Cheap to clone; one clone per in-flight request is fine.
#[derive(Clone)]
pub struct PresenceIngest {
    tx: mpsc::Sender<UpdateEnvelope>,
    submit_timeout: Option<Duration>,
    counters: Arc<IngestCounters>,
}

/// Build the channel. `capacity` is clamped to `1..=MAX_CHANNEL_CAPACITY`.
pub fn ingest_channel(capacity: usize, submit_timeout: Option<Duration>) -> (PresenceIngest, IngestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.clamp(1, MAX_CHANNEL_CAPACITY));
    let ingest = PresenceIngest {
        tx,
        submit_timeout,
        counters: Arc::new(IngestCounters::default()),
    };
    (ingest, rx)
}

impl PresenceIngest {
    /// Enqueue, waiting for capacity for at most the submit timeout.
    pub async fn submit(&self, envelope: UpdateEnvelope) -> SubmitOutcome {
        let result = match self.submit_timeout {
            Some(timeout) => self.tx.send_timeout(envelope, timeout).await.map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DropReason::TimedOut,
                SendTimeoutError::Closed(_) => DropReason::Closed,
            }),
            None => self.tx.send(envelope).await.map_err(|_| DropReason::Closed),
        };
        self.record(result)
    }

    /// Enqueue only if there is room right now.
    pub fn try_submit(&self, envelope: UpdateEnvelope) -> SubmitOutcome {
        let result = self.tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => DropReason::Full,
            TrySendError::Closed(_) => DropReason::Closed,
        });
        self.record(result)
    }

    fn record(&self, result: Result<(), DropReason>) -> SubmitOutcome {
        match result {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Queued
            }
            Err(reason) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped presence update ({:?})", reason);
                SubmitOutcome::Dropped(reason)
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            queued: self.counters.queued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            capacity: self.tx.max_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(user_id: u64) -> UpdateEnvelope {
        UpdateEnvelope::new(user_id, format!("10.0.0.{}", user_id), "test-agent").unwrap()
    }

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let (ingest, mut rx) = ingest_channel(8, None);
        for id in 1..=5 {
            assert_eq!(ingest.submit(env(id)).await, SubmitOutcome::Queued);
        }
        for id in 1..=5 {
            assert_eq!(rx.recv().await.unwrap().user_id(), id);
        }
        assert_eq!(ingest.snapshot().queued, 5);
    }

    #[tokio::test]
    async fn try_submit_drops_when_full() {
        let (ingest, _rx) = ingest_channel(2, None);
        assert_eq!(ingest.try_submit(env(1)), SubmitOutcome::Queued);
        assert_eq!(ingest.try_submit(env(2)), SubmitOutcome::Queued);
        assert_eq!(ingest.try_submit(env(3)), SubmitOutcome::Dropped(DropReason::Full));

        let snap = ingest.snapshot();
        assert_eq!(snap.queued, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.queue_depth, 2);
        assert_eq!(snap.capacity, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_submit_times_out_and_counts() {
        let (ingest, _rx) = ingest_channel(1, Some(Duration::from_millis(100)));
        assert_eq!(ingest.submit(env(1)).await, SubmitOutcome::Queued);

        let started = tokio::time::Instant::now();
        assert_eq!(ingest.submit(env(2)).await, SubmitOutcome::Dropped(DropReason::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(ingest.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn bounded_submit_succeeds_once_consumer_frees_capacity() {
        let (ingest, mut rx) = ingest_channel(1, Some(Duration::from_secs(5)));
        assert_eq!(ingest.submit(env(1)).await, SubmitOutcome::Queued);

        let consumer = tokio::spawn(async move {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            (first.user_id(), second.user_id())
        });
        assert_eq!(ingest.submit(env(2)).await, SubmitOutcome::Queued);
        assert_eq!(consumer.await.unwrap(), (1, 2));
    }

    #[tokio::test]
    async fn closed_channel_drops_silently() {
        let (ingest, rx) = ingest_channel(4, None);
        drop(rx);
        assert_eq!(ingest.submit(env(1)).await, SubmitOutcome::Dropped(DropReason::Closed));
        assert_eq!(ingest.try_submit(env(2)), SubmitOutcome::Dropped(DropReason::Closed));
        assert_eq!(ingest.snapshot().dropped, 2);
    }

    #[test]
    fn capacity_is_clamped_to_the_maximum() {
        let (ingest, _rx) = ingest_channel(usize::MAX, None);
        assert_eq!(ingest.snapshot().capacity, MAX_CHANNEL_CAPACITY);
    }
}
