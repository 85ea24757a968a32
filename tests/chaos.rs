//! Chaos Testing for the Proxy Data Cache
//!
//! This module tests failure scenarios using:
//! 1. **FailingBackend wrapper** - precise error injection at specific call counts
//! 2. **Collector doubles** - rejecting and hanging upstreams
//! 3. **Lifecycle abuse** - double starts, early shutdowns
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use proxy_data_cache::{
    Backend, BackendError, CacheMode, CacheRecord, Collector, DeliveryBatch, DeliveryError,
    EngineState, HaGate, HistoryPayload, IngestError, MemoryBackend, NullCollector, PdcConfig,
    ProxyDataCache, RecordKind, RecordPayload,
};

// =============================================================================
// Failing Backend Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a real backend and fails chosen operations at chosen call
/// counts (1-indexed), so tests can hit one exact error path.
///
/// Injection targets a single record kind: the flush engine sweeps
/// every kind each pass, and counting the other kinds' (empty) drains
/// would make the call numbers depend on sweep interleaving.
struct FailingBackend<B: Backend> {
    inner: B,
    target_kind: RecordKind,
    append_calls: AtomicU64,
    drain_calls: AtomicU64,
    purge_calls: AtomicU64,
    /// Fail appends from this call number onwards (0 = never).
    fail_appends_from: u64,
    /// Fail drains on exactly these call numbers.
    fail_drains_on: Vec<u64>,
    /// Fail purges on exactly these call numbers.
    fail_purges_on: Vec<u64>,
}

impl<B: Backend> FailingBackend<B> {
    fn new(inner: B, target_kind: RecordKind) -> Self {
        Self {
            inner,
            target_kind,
            append_calls: AtomicU64::new(0),
            drain_calls: AtomicU64::new(0),
            purge_calls: AtomicU64::new(0),
            fail_appends_from: 0,
            fail_drains_on: Vec::new(),
            fail_purges_on: Vec::new(),
        }
    }

    fn fail_appends_from(mut self, n: u64) -> Self {
        self.fail_appends_from = n;
        self
    }

    fn fail_drains_on(mut self, calls: Vec<u64>) -> Self {
        self.fail_drains_on = calls;
        self
    }

    fn fail_purges_on(mut self, calls: Vec<u64>) -> Self {
        self.fail_purges_on = calls;
        self
    }
}

#[async_trait]
impl<B: Backend> Backend for FailingBackend<B> {
    async fn append(&self, record: CacheRecord) -> Result<u64, BackendError> {
        if record.kind() == self.target_kind {
            let call = self.append_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_appends_from > 0 && call >= self.fail_appends_from {
                return Err(BackendError::Store("injected append failure".to_string()));
            }
        }
        self.inner.append(record).await
    }

    async fn drain(
        &self,
        kind: RecordKind,
        after_id: u64,
        max_batch: usize,
    ) -> Result<Vec<CacheRecord>, BackendError> {
        if kind == self.target_kind {
            let call = self.drain_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_drains_on.contains(&call) {
                return Err(BackendError::Store("injected drain failure".to_string()));
            }
        }
        self.inner.drain(kind, after_id, max_batch).await
    }

    async fn purge(&self, kind: RecordKind, ids: &[u64]) -> Result<u64, BackendError> {
        if kind == self.target_kind {
            let call = self.purge_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_purges_on.contains(&call) {
                return Err(BackendError::Store("injected purge failure".to_string()));
            }
        }
        self.inner.purge(kind, ids).await
    }

    async fn pending(&self, kind: RecordKind) -> Result<u64, BackendError> {
        self.inner.pending(kind).await
    }

    async fn expire(&self, kind: RecordKind, horizon_clock: i64) -> Result<u64, BackendError> {
        self.inner.expire(kind, horizon_clock).await
    }

    async fn load_cursor(&self, kind: RecordKind) -> Result<u64, BackendError> {
        self.inner.load_cursor(kind).await
    }

    async fn store_cursor(&self, kind: RecordKind, acked_id: u64) -> Result<(), BackendError> {
        self.inner.store_cursor(kind, acked_id).await
    }
}

// =============================================================================
// Collector Doubles
// =============================================================================

struct RecordingCollector {
    batches: Mutex<Vec<DeliveryBatch>>,
}

impl RecordingCollector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }

    fn delivered_ids(&self, kind: RecordKind) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.kind == kind)
            .flat_map(|b| b.ids())
            .collect()
    }

    fn record_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
    }
}

#[async_trait]
impl Collector for RecordingCollector {
    async fn deliver(&self, batch: &DeliveryBatch) -> Result<(), DeliveryError> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Never answers within any sane delivery timeout.
struct HangingCollector;

#[async_trait]
impl Collector for HangingCollector {
    async fn deliver(&self, _batch: &DeliveryBatch) -> Result<(), DeliveryError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn history(itemid: u64) -> RecordPayload {
    RecordPayload::History(HistoryPayload {
        itemid,
        value: itemid.to_string(),
        ns: 0,
        state: 0,
    })
}

fn chaos_config() -> PdcConfig {
    PdcConfig {
        mode: CacheMode::Database,
        delivery_backoff_ms: 1,
        delivery_backoff_max_ms: 5,
        ..Default::default()
    }
}

/// Database-mode cache running on an injected (wrapped) store.
async fn cache_on(store: Arc<dyn Backend>, collector: Arc<dyn Collector>) -> ProxyDataCache {
    let config = chaos_config();
    let (_tx, rx) = watch::channel(config.clone());
    let mut cache = ProxyDataCache::new(config, rx, collector, HaGate::standalone())
        .with_store(store);
    cache.start().await.expect("Failed to start cache");
    cache
}

// =============================================================================
// Chaos Tests
// =============================================================================

#[tokio::test]
async fn chaos_drain_failure_is_transient() {
    let store = Arc::new(
        FailingBackend::new(MemoryBackend::new(1000), RecordKind::History).fail_drains_on(vec![1]),
    );
    let collector = RecordingCollector::new();
    let cache = cache_on(store, collector.clone()).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(cache.write(RecordKind::History, history(i), 100).await.unwrap());
    }

    // First cycle hits the injected drain error and delivers nothing.
    assert_eq!(cache.tick().await, 0);
    assert_eq!(collector.record_count(), 0);

    // Nothing was lost or skipped: the next cycle delivers everything.
    assert_eq!(cache.tick().await, 3);
    assert_eq!(collector.delivered_ids(RecordKind::History), ids);
}

#[tokio::test]
async fn chaos_append_failure_surfaces_to_producer() {
    let store = Arc::new(
        FailingBackend::new(MemoryBackend::new(1000), RecordKind::History).fail_appends_from(3),
    );
    let collector = RecordingCollector::new();
    let cache = cache_on(store, collector.clone()).await;

    cache.write(RecordKind::History, history(1), 100).await.unwrap();
    cache.write(RecordKind::History, history(2), 100).await.unwrap();

    // The store is now refusing appends; each producer sees its own error.
    for i in 3..5 {
        let err = cache
            .write(RecordKind::History, history(i), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::StoreError(_)));
    }

    // The two accepted records are unaffected.
    assert_eq!(cache.tick().await, 2);
    assert_eq!(collector.record_count(), 2);
}

#[tokio::test]
async fn chaos_purge_failure_re_sends_batch() {
    let store = Arc::new(
        FailingBackend::new(MemoryBackend::new(1000), RecordKind::History).fail_purges_on(vec![1]),
    );
    let collector = RecordingCollector::new();
    let cache = cache_on(store, collector.clone()).await;

    let mut ids = Vec::new();
    for i in 0..2 {
        ids.push(cache.write(RecordKind::History, history(i), 100).await.unwrap());
    }

    // The batch is delivered, but the acknowledgment bookkeeping dies on
    // the injected purge failure, so the cycle reports nothing flushed.
    assert_eq!(cache.tick().await, 0);

    // At-least-once: the same batch goes out again and this time the
    // acknowledgment completes.
    assert_eq!(cache.tick().await, 2);
    let mut expected = ids.clone();
    expected.extend_from_slice(&ids);
    assert_eq!(collector.delivered_ids(RecordKind::History), expected);

    // Fully acknowledged now, nothing left to send.
    assert_eq!(cache.tick().await, 0);
}

#[tokio::test]
async fn chaos_hanging_upstream_times_out_and_keeps_backlog() {
    let store = Arc::new(FailingBackend::new(MemoryBackend::new(1000), RecordKind::History));
    let config = PdcConfig {
        delivery_timeout_ms: 50,
        delivery_max_attempts: 2,
        ..chaos_config()
    };
    let (_tx, rx) = watch::channel(config.clone());
    let mut cache = ProxyDataCache::new(config, rx, Arc::new(HangingCollector), HaGate::standalone())
        .with_store(store);
    cache.start().await.expect("Failed to start cache");

    for i in 0..3 {
        cache.write(RecordKind::History, history(i), 100).await.unwrap();
    }

    // Both attempts time out; the records stay buffered for later.
    assert_eq!(cache.tick().await, 0);
    let stats = cache.stats().await;
    assert_eq!(
        stats
            .per_kind
            .iter()
            .find(|k| k.kind == RecordKind::History)
            .unwrap()
            .pending,
        3
    );
}

#[tokio::test]
async fn chaos_lifecycle_abuse_is_harmless() {
    let store = Arc::new(FailingBackend::new(MemoryBackend::new(1000), RecordKind::History));
    let config = chaos_config();
    let (_tx, rx) = watch::channel(config.clone());
    let mut cache = ProxyDataCache::new(config, rx, Arc::new(NullCollector), HaGate::standalone())
        .with_store(store);

    assert_eq!(cache.state(), EngineState::Created);
    cache.start().await.expect("first start");
    assert_eq!(cache.state(), EngineState::Ready);

    // Second start is a no-op.
    cache.start().await.expect("second start");
    assert_eq!(cache.state(), EngineState::Ready);

    cache.shutdown().await;
    assert_eq!(cache.state(), EngineState::Stopped);

    // Repeated shutdowns stay stopped; ticks after shutdown do nothing.
    cache.shutdown().await;
    assert_eq!(cache.state(), EngineState::Stopped);
    assert_eq!(cache.tick().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_writers_with_dying_store() {
    // The store dies partway through a concurrent write storm. Exactly
    // the first 50 appends land (regardless of writer interleaving);
    // each writer sees its own per-record result, and the survivors
    // come out exactly once, in id order.
    let store = Arc::new(
        FailingBackend::new(MemoryBackend::new(10_000), RecordKind::History).fail_appends_from(51),
    );
    let collector = RecordingCollector::new();
    let cache = Arc::new(cache_on(store, collector.clone()).await);

    let mut handles = Vec::new();
    for writer in 0..4u64 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let mut ok = 0usize;
            for i in 0..25u64 {
                if cache
                    .write(RecordKind::History, history(writer * 100 + i), 100)
                    .await
                    .is_ok()
                {
                    ok += 1;
                }
            }
            ok
        }));
    }

    let mut accepted = 0usize;
    for handle in handles {
        accepted += handle.await.unwrap();
    }
    assert_eq!(accepted, 50);

    assert_eq!(cache.tick().await, 50);
    let mut ids = collector.delivered_ids(RecordKind::History);
    assert_eq!(ids.len(), 50);
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "delivery out of id order");
    }
    ids.dedup();
    assert_eq!(ids.len(), 50, "duplicate ids delivered");
}
