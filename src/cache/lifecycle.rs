//! Engine lifecycle: startup phases, the main loop and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::record::RecordKind;
use crate::state::CacheMode;
use crate::storage::{BackendError, SqlBackend};

use super::types::EngineState;
use super::ProxyDataCache;

impl ProxyDataCache {
    /// Start the engine: validate config, connect the database store
    /// and recover flush cursors.
    ///
    /// Leaves the engine in `Ready` state. Call [`run`](Self::run) (or
    /// drive [`tick`](Self::tick) manually) afterwards.
    #[tracing::instrument(skip(self), fields(mode, has_store))]
    pub async fn start(&mut self) -> Result<(), BackendError> {
        if self.state() != EngineState::Created {
            warn!(state = %self.state(), "start() called more than once, ignoring");
            return Ok(());
        }

        let start_time = std::time::Instant::now();
        info!("Starting proxy data cache...");
        let _ = self.state.send(EngineState::Connecting);
        crate::metrics::set_engine_state("connecting");

        let (mode, store_url, memory_capacity) = {
            let config = self.config.read();
            (config.mode, config.store_url.clone(), config.memory_capacity)
        };
        tracing::Span::current().record("mode", mode.as_str());

        // ========== PHASE 1: Validate configuration ==========
        let phase_start = std::time::Instant::now();
        let needs_store = matches!(mode, CacheMode::Database | CacheMode::DatabaseOnly);
        if needs_store && store_url.is_none() && self.store.is_none() {
            error!(mode = %mode, "Database mode requires store_url or an injected store");
            return Err(BackendError::Unavailable(
                "database modes require store_url or an injected store".to_string(),
            ));
        }
        if mode == CacheMode::Memory {
            if memory_capacity == 0 {
                warn!("Memory mode with zero capacity, the first write will fall back to the database");
            }
            if store_url.is_none() && self.store.is_none() {
                warn!("Memory mode has no database store configured, a memory fallback would reject writes");
            }
        }
        crate::metrics::record_startup_phase("validate", phase_start.elapsed());

        // ========== PHASE 2: Connect the database store ==========
        let phase_start = std::time::Instant::now();
        if self.store.is_some() {
            info!("Using injected database store");
        } else if let Some(url) = &store_url {
            let store = SqlBackend::new(url).await?;
            self.store = Some(Arc::new(store));
            info!("Database store connected");
        } else {
            debug!("No database store configured");
        }
        tracing::Span::current().record("has_store", self.store.is_some());
        crate::metrics::record_startup_phase("store_connect", phase_start.elapsed());

        // ========== PHASE 3: Recover flush cursors ==========
        // A restart resumes exactly where the last acknowledged batch
        // ended; anything past the cursor is backlog waiting to flush.
        let phase_start = std::time::Instant::now();
        if let Some(store) = self.store.as_deref() {
            for kind in RecordKind::ALL {
                let cursor = store.load_cursor(kind).await?;
                let pending = store.pending(kind).await?;
                if pending > 0 {
                    info!(
                        kind = %kind,
                        cursor,
                        pending,
                        "Resuming flush behind persisted cursor"
                    );
                } else {
                    debug!(kind = %kind, cursor, "No backlog for kind");
                }
            }
        }
        crate::metrics::record_startup_phase("cursor_recovery", phase_start.elapsed());

        let _ = self.state.send(EngineState::Ready);
        crate::metrics::set_engine_state("ready");
        info!(
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Proxy data cache ready"
        );
        Ok(())
    }

    /// Run the main event loop until shutdown is signalled.
    ///
    /// Drives periodic flushing, stats logging, retention maintenance
    /// and config reloads. Intended to be spawned once; a second
    /// concurrent call returns immediately.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        let Ok(mut config_rx) = self.config_rx.try_lock() else {
            warn!("run() already active, second call ignored");
            return;
        };

        let _ = self.state.send(EngineState::Running);
        crate::metrics::set_engine_state("running");
        info!("Proxy data cache running");

        let (flush_ms, stats_secs, maintenance_secs) = {
            let config = self.config.read();
            (
                config.flush_interval_ms,
                config.stats_interval_secs,
                config.maintenance_interval_secs,
            )
        };
        let mut flush_interval = tokio::time::interval(Duration::from_millis(flush_ms.max(1)));
        let mut stats_interval = tokio::time::interval(Duration::from_secs(stats_secs.max(1)));
        let mut maintenance_interval =
            tokio::time::interval(Duration::from_secs(maintenance_secs.max(1)));

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signalled, leaving main loop");
                        break;
                    }
                }

                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    self.apply_config(new_config);
                }

                _ = flush_interval.tick() => {
                    self.flush_pass().await;
                }

                _ = stats_interval.tick() => {
                    self.log_stats().await;
                }

                _ = maintenance_interval.tick() => {
                    self.expire_tick().await;
                }
            }
        }
    }

    /// Apply a reloaded configuration.
    ///
    /// Mode changes take effect immediately (subject to the memory
    /// fallback latch). Buffer capacity and timing changes need a
    /// restart and are only noted.
    fn apply_config(&self, new_config: crate::config::PdcConfig) {
        let old_mode = self.config.read().mode;
        if new_config.mode != old_mode {
            self.transition(new_config.mode);
        }

        {
            let mut config = self.config.write();
            if new_config.memory_capacity != config.memory_capacity {
                warn!(
                    old = config.memory_capacity,
                    new = new_config.memory_capacity,
                    "Memory capacity change requires a restart, keeping current buffers"
                );
            }
            *config = new_config;
        }
        info!("Configuration updated");
    }

    /// Log a stats line and refresh the backlog gauges.
    async fn log_stats(&self) {
        let stats = self.stats().await;
        let backlog: u64 = stats.per_kind.iter().map(|k| k.pending).sum();
        info!(
            mode = %stats.mode,
            backlog,
            total_written = stats.total_written,
            total_flushed = stats.total_flushed,
            total_expired = stats.total_expired,
            "Cache stats"
        );
    }

    /// Run one flush pass by hand instead of waiting for the run loop.
    ///
    /// Flushes every kind's backlog once and returns the number of
    /// records delivered. This is the deterministic entry point for
    /// tests and for embedders that schedule flushing themselves.
    pub async fn tick(&self) -> usize {
        self.flush_pass().await
    }

    /// Run one retention sweep by hand.
    ///
    /// No-op unless `retention_hours` is set.
    pub async fn maintain(&self) {
        self.expire_tick().await;
    }

    /// Initiate graceful shutdown.
    ///
    /// Makes a final flush pass so a clean stop leaves as little
    /// backlog as possible (memory-mode backlog does not survive the
    /// process), then stops the run loop and aborts any in-flight
    /// delivery retry between attempts. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let initiated = self.state.send_if_modified(|state| {
            if matches!(*state, EngineState::ShuttingDown | EngineState::Stopped) {
                false
            } else {
                *state = EngineState::ShuttingDown;
                true
            }
        });
        if !initiated {
            debug!("Shutdown already in progress");
            return;
        }

        let shutdown_start = std::time::Instant::now();
        info!("Shutting down proxy data cache...");
        crate::metrics::set_engine_state("shutting_down");

        let delivered = self.flush_pass().await;
        if delivered > 0 {
            info!(delivered, "Final flush on shutdown");
        }

        self.shutdown.send_replace(true);

        let _ = self.state.send(EngineState::Stopped);
        crate::metrics::set_engine_state("stopped");
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Proxy data cache shutdown complete");
    }
}
