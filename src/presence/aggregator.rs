//! Batch aggregator: the single consumer of the ingestion channel.
//!
//! One task owns the batch buffer and selects over three sources: a new
//! envelope, the flush timer, and the shutdown signal. Size and time triggers
//! therefore never race on the buffer and no lock guards it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::channel::IngestReceiver;
use super::{delayed_ticker, UpdateEnvelope};
use crate::store::SharedStore;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_BATCH_SIZE: usize = 10_000;

/// The buffer grows past this on demand instead of reserving up front.
const PREALLOCATED_BATCH: usize = 1024;

/// Outcome of one flush. Items are attempted independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub persisted: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct AggregatorStats {
    flushes: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorSnapshot {
    pub flushes: u64,
    pub persisted: u64,
    pub failed: u64,
}

impl AggregatorStats {
    fn record(&self, report: &FlushReport) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.persisted.fetch_add(report.persisted as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct BatchAggregator {
    store: SharedStore,
    batch_size: usize,
    flush_interval: Duration,
    batch: Vec<UpdateEnvelope>,
    stats: Arc<AggregatorStats>,
    flush_observer: Option<mpsc::UnboundedSender<FlushReport>>,
}

impl BatchAggregator {
    pub fn new(store: SharedStore, batch_size: usize, flush_interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            flush_interval,
            batch: Vec::with_capacity(batch_size.min(PREALLOCATED_BATCH)),
            stats: Arc::new(AggregatorStats::default()),
            flush_observer: None,
        }
    }

    /// Every flush report is also sent here (status surfaces, tests).
    pub fn with_flush_observer(mut self, observer: mpsc::UnboundedSender<FlushReport>) -> Self {
        self.flush_observer = Some(observer);
        self
    }

    pub fn stats(&self) -> Arc<AggregatorStats> {
        self.stats.clone()
    }

    /// Consume envelopes until shutdown is signalled or every producer is gone.
    /// Whatever is still queued or buffered at that point is flushed before returning.
    pub async fn run(mut self, mut rx: IngestReceiver, mut shutdown: watch::Receiver<bool>) -> AggregatorSnapshot {
        let mut ticker = delayed_ticker(self.flush_interval);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(envelope) => self.accept(envelope).await,
                    None => {
                        debug!("Ingestion channel closed; aggregator stopping");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        rx.close();
                        while let Some(envelope) = rx.recv().await {
                            self.accept(envelope).await;
                        }
                        break;
                    }
                }
            }
        }

        if !self.batch.is_empty() {
            self.flush().await;
        }
        let totals = self.stats.snapshot();
        info!(
            "Presence aggregator stopped after {} flushes ({} persisted, {} failed)",
            totals.flushes, totals.persisted, totals.failed
        );
        totals
    }

    async fn accept(&mut self, envelope: UpdateEnvelope) {
        self.batch.push(envelope);
        if self.batch.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Upsert every buffered envelope with a per-item timestamp, then clear the
    /// buffer regardless of failures.
    async fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        for envelope in self.batch.drain(..) {
            report.attempted += 1;
            let upsert = self
                .store
                .upsert_presence(
                    envelope.user_id(),
                    envelope.address(),
                    envelope.client_signature(),
                    Utc::now(),
                )
                .await;
            match upsert {
                Ok(()) => report.persisted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Dropping presence update for user {}: {}", envelope.user_id(), e);
                }
            }
        }

        self.stats.record(&report);
        if report.failed > 0 {
            warn!(
                "Flushed {} presence updates ({} failed)",
                report.attempted, report.failed
            );
        } else {
            info!("Flushed {} presence updates", report.attempted);
        }
        if let Some(observer) = &self.flush_observer {
            let _ = observer.send(report);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::channel::ingest_channel;
    use crate::presence::PresenceRecord;
    use crate::store::{InMemoryPresenceStore, PresenceStore, StoreError};
    use crate::UserId;
    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::Mutex;
    use tokio::time::Instant;
    use tokio::task::JoinHandle;

    /// Records every upsert call in order; fails for the listed users.
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<(UserId, String)>>,
        failing: Vec<UserId>,
        inner: InMemoryPresenceStore,
    }

    #[async_trait]
    impl PresenceStore for RecordingStore {
        async fn upsert_presence(
            &self,
            user_id: UserId,
            address: &str,
            client_signature: &str,
            observed_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.calls.lock().await.push((user_id, address.to_string()));
            if self.failing.contains(&user_id) {
                return Err(StoreError::Backend("write refused".to_string()));
            }
            self.inner
                .upsert_presence(user_id, address, client_signature, observed_at)
                .await
        }

        async fn delete_presence_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.delete_presence_older_than(cutoff).await
        }

        async fn count_presence_newer_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.count_presence_newer_than(cutoff).await
        }

        async fn get_presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError> {
            self.inner.get_presence(user_id).await
        }

        fn backend_name(&self) -> &'static str {
            "recording"
        }
    }

    struct Harness {
        ingest: crate::presence::PresenceIngest,
        flushes: mpsc::UnboundedReceiver<FlushReport>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<AggregatorSnapshot>,
        store: Arc<RecordingStore>,
    }

    fn start(store: RecordingStore, batch_size: usize, interval: Duration) -> Harness {
        let store = Arc::new(store);
        let (ingest, rx) = ingest_channel(1000, None);
        let (flush_tx, flushes) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let aggregator = BatchAggregator::new(store.clone(), batch_size, interval).with_flush_observer(flush_tx);
        let handle = tokio::spawn(aggregator.run(rx, shutdown_rx));
        Harness {
            ingest,
            flushes,
            shutdown,
            handle,
            store,
        }
    }

    fn env(user_id: UserId, address: &str) -> UpdateEnvelope {
        UpdateEnvelope::new(user_id, address, "Mozilla/5.0").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_immediately() {
        let mut h = start(RecordingStore::default(), 50, Duration::from_secs(5));
        let started = Instant::now();
        for id in 1..=50 {
            h.ingest.submit(env(id, "10.0.0.1")).await;
        }

        let report = h.flushes.recv().await.unwrap();
        assert_eq!(report.attempted, 50);
        assert_eq!(report.persisted, 50);
        assert!(started.elapsed() < Duration::from_secs(5));

        // Batch was reset: the next tick has nothing to flush.
        let idle = tokio::time::timeout(Duration::from_secs(12), h.flushes.recv()).await;
        assert!(idle.is_err());
        assert_eq!(h.store.calls.lock().await.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_on_interval() {
        let mut h = start(RecordingStore::default(), 50, Duration::from_secs(5));
        let started = Instant::now();
        for id in 1..=3 {
            h.ingest.submit(env(id, "10.0.0.1")).await;
        }

        let report = h.flushes.recv().await.unwrap();
        assert_eq!(report.attempted, 3);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(h.flushes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_never_flushes() {
        let mut h = start(RecordingStore::default(), 50, Duration::from_secs(5));
        let idle = tokio::time::timeout(Duration::from_secs(30), h.flushes.recv()).await;
        assert!(idle.is_err());
        assert_eq!(h.store.calls.lock().await.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_never_exceed_threshold() {
        let mut h = start(RecordingStore::default(), 50, Duration::from_secs(5));
        for id in 1..=120 {
            h.ingest.submit(env(id, "10.0.0.1")).await;
        }

        let sizes = vec![
            h.flushes.recv().await.unwrap().attempted,
            h.flushes.recv().await.unwrap().attempted,
            h.flushes.recv().await.unwrap().attempted,
        ];
        assert_eq!(sizes, vec![50, 50, 20]);

        // Every envelope reached exactly one upsert, in submission order.
        let calls = h.store.calls.lock().await;
        let ids: Vec<UserId> = calls.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, (1..=120).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn last_write_wins_within_a_batch() {
        let mut h = start(RecordingStore::default(), 50, Duration::from_secs(5));
        h.ingest.submit(env(7, "10.0.0.1")).await;
        h.ingest.submit(env(7, "10.0.0.2")).await;

        let report = h.flushes.recv().await.unwrap();
        assert_eq!(report.attempted, 2);
        let rec = h.store.get_presence(7).await.unwrap().unwrap();
        assert_eq!(rec.address, "10.0.0.2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_item_does_not_block_the_rest() {
        let store = RecordingStore {
            failing: vec![2],
            ..Default::default()
        };
        let mut h = start(store, 3, Duration::from_secs(5));
        for id in 1..=3 {
            h.ingest.submit(env(id, "10.0.0.1")).await;
        }

        let report = h.flushes.recv().await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                attempted: 3,
                persisted: 2,
                failed: 1
            }
        );
        assert!(h.store.get_presence(1).await.unwrap().is_some());
        assert!(h.store.get_presence(2).await.unwrap().is_none());
        assert!(h.store.get_presence(3).await.unwrap().is_some());

        // Buffer was cleared; the failed envelope is not retried.
        let idle = tokio::time::timeout(Duration::from_secs(12), h.flushes.recv()).await;
        assert!(idle.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_partial_batch() {
        let h = start(RecordingStore::default(), 50, Duration::from_secs(60));
        for id in 1..=4 {
            h.ingest.submit(env(id, "10.0.0.1")).await;
        }

        h.shutdown.send(true).unwrap();
        let totals = h.handle.await.unwrap();
        assert_eq!(
            totals,
            AggregatorSnapshot {
                flushes: 1,
                persisted: 4,
                failed: 0
            }
        );
        assert_eq!(h.store.inner.len().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_producer_stops_and_flushes() {
        let h = start(RecordingStore::default(), 50, Duration::from_secs(60));
        h.ingest.submit(env(1, "10.0.0.1")).await;
        let Harness {
            ingest,
            handle,
            store,
            shutdown,
            ..
        } = h;
        drop(ingest);

        let totals = handle.await.unwrap();
        assert_eq!(totals.persisted, 1);
        assert_eq!(store.inner.len().await, 1);
        drop(shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_flush_interval_keeps_the_aggregator_alive() {
        let mut h = start(RecordingStore::default(), 2, Duration::from_secs(u64::MAX));
        assert_eq!(h.ingest.submit(env(1, "10.0.0.1")).await, crate::presence::SubmitOutcome::Queued);
        assert_eq!(h.ingest.submit(env(2, "10.0.0.1")).await, crate::presence::SubmitOutcome::Queued);

        let report = h.flushes.recv().await.unwrap();
        assert_eq!(report.persisted, 2);
        assert!(!h.handle.is_finished());

        h.shutdown.send(true).unwrap();
        assert_eq!(h.handle.await.unwrap().persisted, 2);
    }

    #[test]
    fn huge_batch_size_does_not_reserve_the_whole_batch() {
        let store: SharedStore = Arc::new(InMemoryPresenceStore::new());
        let aggregator = BatchAggregator::new(store, usize::MAX, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(aggregator.batch_size, usize::MAX);
        assert!(aggregator.batch.capacity() <= PREALLOCATED_BATCH);
    }
}
