//! # Proxy Data Cache
//!
//! A store-and-forward cache that decouples monitoring proxy producers
//! from the upstream server.
//!
//! ## Architecture
//!
//! Producers write records into a local tier and carry on; a flush
//! engine forwards the backlog upstream in order, batch by batch:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Producers                            │
//! │  • Pollers and trappers call write(kind, payload, clock)   │
//! │  • Never blocked by upstream outages                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Mode & Routing                         │
//! │  • disabled / memory / database / database-only            │
//! │  • One-way memory → database fallback latch                │
//! └─────────────────────────────────────────────────────────────┘
//!                │                             │
//!                ▼                             ▼
//! ┌──────────────────────────┐  ┌─────────────────────────────┐
//! │     Memory buffers       │  │      Local database         │
//! │  • Bounded per-kind      │  │  • SQLite or MySQL          │
//! │    queues, volatile      │  │  • Backlog survives restart │
//! │  • Monotonic ids         │  │  • Monotonic ids per kind   │
//! └──────────────────────────┘  └─────────────────────────────┘
//!                │                             │
//!                └──────────────┬──────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Flush Engine                          │
//! │  • Drains past the cursor in id order                      │
//! │  • Acknowledged batches purge and advance the cursor       │
//! │  • Failed batches re-sent unchanged with backoff           │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Collector (upstream)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use proxy_data_cache::{
//!     CacheMode, HaGate, HistoryPayload, NullCollector, PdcConfig, ProxyDataCache,
//! };
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PdcConfig {
//!         mode: CacheMode::Database,
//!         store_url: Some("sqlite:proxy_cache.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let mut cache =
//!         ProxyDataCache::new(config, rx, Arc::new(NullCollector), HaGate::standalone());
//!
//!     // Start the cache (connects the store, recovers flush cursors)
//!     cache.start().await.expect("Failed to start");
//!
//!     // Spawn the main loop, keep a handle for producers
//!     let cache = Arc::new(cache);
//!     let runner = cache.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     // Buffer a record; the flush engine forwards it upstream
//!     let payload = HistoryPayload {
//!         itemid: 10042,
//!         value: "1.73".into(),
//!         ns: 0,
//!         state: 0,
//!     };
//!     let id = cache
//!         .write_history(payload, 1_700_000_000)
//!         .await
//!         .expect("Failed to write");
//!     println!("buffered record {id}");
//!
//!     cache.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Four modes**: disabled / memory / database / database-only, switchable at runtime
//! - **Automatic fallback**: a memory tier that cannot take records permanently demotes to database-only
//! - **Ordered delivery**: monotonic per-kind ids, the flush cursor never passes an unacknowledged batch
//! - **Crash recovery**: database-mode backlog and cursors survive restarts
//! - **At-least-once upstream**: failed batches are re-sent unchanged with exponential backoff
//! - **HA aware**: standby nodes neither write to the shared database nor flush
//! - **Retention sweeps**: optional age-based expiry of unacknowledged backlog
//! - **Retry Logic**: configurable retry policies for transient store failures
//!
//! ## Configuration
//!
//! See [`PdcConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`cache`]: The main [`ProxyDataCache`] engine orchestrating all components
//! - [`record`]: Record kinds and payloads
//! - [`state`]: Mode state machine and destination routing
//! - [`storage`]: Buffer backends (memory, SQL)
//! - [`collector`]: Upstream delivery seam
//! - [`ha`]: Active/standby gating
//! - [`resilience`]: Retry logic for transient store failures
//! - [`metrics`]: Prometheus-style instrumentation

pub mod config;
pub mod record;
pub mod state;
pub mod ha;
pub mod storage;
pub mod collector;
pub mod resilience;
pub mod cache;
pub mod metrics;

pub use config::PdcConfig;
pub use cache::{
    CacheStats, EngineState, FlushError, FlushOutcome, IngestError, KindStats, ProxyDataCache,
};
pub use record::{
    AutoregPayload, CacheRecord, DiscoveryPayload, HistoryPayload, RecordKind, RecordPayload,
};
pub use state::{CacheMode, CacheState, Destination};
pub use storage::{Backend, BackendError, MemoryBackend, SqlBackend};
pub use collector::{Collector, DeliveryBatch, DeliveryError, NullCollector};
pub use ha::{HaGate, NodeRole};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
