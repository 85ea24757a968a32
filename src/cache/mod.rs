// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The proxy data cache engine.
//!
//! [`ProxyDataCache`] is the coordinator that ties the pieces together:
//! producers call [`write`](ProxyDataCache::write), records land in the
//! tier selected by the current [`CacheMode`](crate::state::CacheMode),
//! and the flush engine drains them upstream through the configured
//! [`Collector`] in id order, one batch per kind at a time.
//!
//! ```text
//!                     write(kind, payload, clock)
//!                               │
//!                       ┌───────▼────────┐
//!                       │   CacheState   │  mode / destination routing,
//!                       │                │  one-way memory fallback
//!                       └───┬────────┬───┘
//!                    Memory │        │ Database
//!                   ┌───────▼──┐  ┌──▼────────┐
//!                   │ Memory   │  │ SQL store │  ids monotonic per kind
//!                   │ backend  │  │ (sqlite / │  flush cursor persisted
//!                   │          │  │  mysql)   │  alongside the records
//!                   └───────┬──┘  └──┬────────┘
//!                           │        │
//!                       ┌───▼────────▼───┐
//!                       │  Flush engine  │  drain → deliver → ack
//!                       └───────┬────────┘
//!                               │
//!                        ┌──────▼──────┐
//!                        │  Collector  │  upstream server
//!                        └─────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! new() → start() → run() ⟲ ... → shutdown()
//! Created  Connecting/Ready  Running      ShuttingDown → Stopped
//! ```
//!
//! `run()` drives periodic flushing, stats logging and retention
//! maintenance until shutdown is signalled. Tests and embedders that
//! want deterministic control can skip `run()` and call
//! [`tick`](ProxyDataCache::tick) instead.

mod api;
mod flush;
mod lifecycle;
mod types;

pub use types::{CacheStats, EngineState, FlushError, FlushOutcome, IngestError, KindStats};

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::collector::Collector;
use crate::config::PdcConfig;
use crate::ha::HaGate;
use crate::record::RecordKind;
use crate::state::CacheState;
use crate::storage::{Backend, MemoryBackend};

/// Store-and-forward cache between proxy producers and the upstream
/// server. See the [module docs](self) for the overall shape.
pub struct ProxyDataCache {
    /// Live configuration. Replaced atomically on config reload.
    pub(super) config: RwLock<PdcConfig>,

    /// Config update channel from the outer proxy process.
    pub(super) config_rx: Mutex<watch::Receiver<PdcConfig>>,

    /// Lifecycle state broadcast to interested observers.
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Mode and destination routing, including the one-way memory
    /// fallback latch.
    pub(super) cache_state: CacheState,

    /// Bounded in-memory tier. Capacity is fixed at creation.
    pub(super) memory: MemoryBackend,

    /// Durable database tier. Connected during `start()` from
    /// `store_url` unless injected with [`with_store`](Self::with_store).
    pub(super) store: Option<Arc<dyn Backend>>,

    /// Upstream delivery client.
    pub(super) collector: Arc<dyn Collector>,

    /// HA role gate. Standalone proxies are always active.
    pub(super) ha: HaGate,

    /// Per-kind flush serialization: at most one in-flight batch per
    /// kind, so the cursor only ever moves behind an acknowledged batch.
    pub(super) flush_locks: DashMap<RecordKind, Arc<Mutex<()>>>,

    /// Shutdown broadcast. Flipped once by `shutdown()`, watched by
    /// `run()` and by in-flight delivery retries.
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) shutdown_rx: watch::Receiver<bool>,

    /// Lifetime counters, exposed through [`stats`](Self::stats).
    pub(super) total_written: AtomicU64,
    pub(super) total_flushed: AtomicU64,
    pub(super) total_expired: AtomicU64,
}

impl ProxyDataCache {
    /// Create a new cache engine.
    ///
    /// The engine starts in `Created` state with no database connection.
    /// Call [`start`](Self::start) to connect and become operational,
    /// then either spawn [`run`](Self::run) or drive flushing manually
    /// with [`tick`](Self::tick).
    ///
    /// # Arguments
    /// * `config` - Initial configuration
    /// * `config_rx` - Watch channel for config updates
    /// * `collector` - Upstream delivery client
    /// * `ha` - HA role gate ([`HaGate::standalone`] for single proxies)
    pub fn new(
        config: PdcConfig,
        config_rx: watch::Receiver<PdcConfig>,
        collector: Arc<dyn Collector>,
        ha: HaGate,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cache_state = CacheState::new(config.mode);
        let memory = MemoryBackend::new(config.memory_capacity);

        info!(
            mode = %config.mode,
            memory_capacity = config.memory_capacity,
            ha_node = ha.node_name().unwrap_or("standalone"),
            "Proxy data cache created"
        );
        crate::metrics::set_cache_mode(config.mode as u8);
        crate::metrics::set_engine_state("created");

        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            cache_state,
            memory,
            store: None,
            collector,
            ha,
            flush_locks: DashMap::new(),
            shutdown: shutdown_tx,
            shutdown_rx,
            total_written: AtomicU64::new(0),
            total_flushed: AtomicU64::new(0),
            total_expired: AtomicU64::new(0),
        }
    }

    /// Inject a pre-built database store.
    ///
    /// `start()` uses this store instead of connecting from
    /// `store_url`. Embedders use it to share a pool with the rest of
    /// the proxy; tests use it to stand in failing backends.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Backend>) -> Self {
        self.store = Some(store);
        self
    }

    /// Get the current engine lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Subscribe to engine state changes.
    ///
    /// Useful for waiting until the engine is `Running` before sending
    /// traffic, or for observing shutdown from another task.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Whether the engine is ready to accept writes.
    #[must_use]
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Per-kind lock guarding the drain → deliver → ack cycle.
    pub(super) fn flush_lock(&self, kind: RecordKind) -> Arc<Mutex<()>> {
        self.flush_locks
            .entry(kind)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::NullCollector;
    use crate::state::CacheMode;

    fn test_config() -> PdcConfig {
        PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 100,
            ..Default::default()
        }
    }

    pub(super) fn create_test_cache(config: PdcConfig) -> ProxyDataCache {
        let (_tx, rx) = watch::channel(config.clone());
        ProxyDataCache::new(config, rx, Arc::new(NullCollector), HaGate::standalone())
    }

    #[test]
    fn test_new_engine_starts_created() {
        let cache = create_test_cache(test_config());
        assert_eq!(cache.state(), EngineState::Created);
        assert!(!cache.is_ready());
    }

    #[test]
    fn test_state_receiver_sees_initial_state() {
        let cache = create_test_cache(test_config());
        let rx = cache.state_receiver();
        assert_eq!(*rx.borrow(), EngineState::Created);
    }

    #[test]
    fn test_flush_lock_is_shared_per_kind() {
        let cache = create_test_cache(test_config());
        let a = cache.flush_lock(RecordKind::History);
        let b = cache.flush_lock(RecordKind::History);
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.flush_lock(RecordKind::Discovery);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
