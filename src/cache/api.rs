//! Producer-facing API: writes, mode control and stats.
//!
//! This module contains the operations proxy producers and the outer
//! process call between `start()` and `shutdown()`:
//! - `write()` - Route one record to the current destination
//! - `write_autoregistration()` / `write_history()` / `write_discovery()` - Typed shorthands
//! - `mode()` / `current_destination()` / `has_fallen_back()` - Routing queries
//! - `transition()` - Apply a mode change
//! - `stats()` - Health and throughput snapshot

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::record::{
    AutoregPayload, CacheRecord, DiscoveryPayload, HistoryPayload, RecordKind, RecordPayload,
};
use crate::state::{CacheMode, Destination};
use crate::storage::{Backend, BackendError};

use super::types::{CacheStats, IngestError, KindStats};
use super::ProxyDataCache;

impl ProxyDataCache {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Ingest
    // ═══════════════════════════════════════════════════════════════════════════

    /// Write one record into the cache.
    ///
    /// The record goes to whatever destination the current mode selects
    /// for `kind`. The call never blocks on upstream delivery; it
    /// returns as soon as the record is buffered, with the id the
    /// backend assigned. Ids are monotonically increasing per kind for
    /// the lifetime of the owning backend.
    ///
    /// In memory mode, a memory tier that cannot take the record (full
    /// or unusable) permanently demotes the cache to database-only mode
    /// and the same call retries against the database, so the producer
    /// only sees an error if the database also fails.
    ///
    /// # Returns
    /// - `Ok(id)` → record buffered, will be flushed upstream in id order
    /// - `Err(IngestError)` → record was not buffered anywhere
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use proxy_data_cache::{ProxyDataCache, RecordKind, RecordPayload, HistoryPayload};
    /// # async fn example(cache: &ProxyDataCache) -> Result<(), Box<dyn std::error::Error>> {
    /// let payload = RecordPayload::History(HistoryPayload {
    ///     itemid: 10042,
    ///     value: "1.73".to_string(),
    ///     ns: 0,
    ///     state: 0,
    /// });
    /// let id = cache.write(RecordKind::History, payload, 1_700_000_000).await?;
    /// println!("buffered as {id}");
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(skip(self, payload), fields(kind = %kind, destination))]
    pub async fn write(
        &self,
        kind: RecordKind,
        payload: RecordPayload,
        clock: i64,
    ) -> Result<u64, IngestError> {
        if payload.kind() != kind {
            crate::metrics::record_ingest_error(kind.as_str(), "unsupported_kind");
            return Err(IngestError::UnsupportedKind {
                expected: kind,
                got: payload.kind(),
            });
        }

        let record = CacheRecord::new(payload, clock);
        let destination = self.cache_state.current_destination(kind);
        tracing::Span::current().record("destination", destination.as_str());

        match destination {
            Destination::None => {
                crate::metrics::record_ingest_error(kind.as_str(), "cache_disabled");
                Err(IngestError::CacheDisabled)
            }
            Destination::Memory => match self.memory.append(record.clone()).await {
                Ok(id) => {
                    self.total_written.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_write(kind.as_str(), "memory", "ok");
                    debug!(id, "Buffered in memory");
                    Ok(id)
                }
                Err(e) => {
                    // One-way latch: exactly one writer wins the demotion
                    // and logs it, everyone else just takes the new route.
                    if self.cache_state.demote_to_database_only() {
                        warn!(
                            error = %e,
                            "Memory tier cannot take records, falling back to \
                             database-only mode for the rest of this process"
                        );
                        crate::metrics::record_memory_fallback();
                        crate::metrics::set_cache_mode(CacheMode::DatabaseOnly as u8);
                    }
                    self.write_database(kind, record).await
                }
            },
            Destination::Database => self.write_database(kind, record).await,
        }
    }

    /// Shorthand for [`write`](Self::write) with an autoregistration payload.
    pub async fn write_autoregistration(
        &self,
        payload: AutoregPayload,
        clock: i64,
    ) -> Result<u64, IngestError> {
        self.write(
            RecordKind::Autoregistration,
            RecordPayload::Autoregistration(payload),
            clock,
        )
        .await
    }

    /// Shorthand for [`write`](Self::write) with a history payload.
    pub async fn write_history(
        &self,
        payload: HistoryPayload,
        clock: i64,
    ) -> Result<u64, IngestError> {
        self.write(RecordKind::History, RecordPayload::History(payload), clock)
            .await
    }

    /// Shorthand for [`write`](Self::write) with a discovery payload.
    pub async fn write_discovery(
        &self,
        payload: DiscoveryPayload,
        clock: i64,
    ) -> Result<u64, IngestError> {
        self.write(
            RecordKind::Discovery,
            RecordPayload::Discovery(payload),
            clock,
        )
        .await
    }

    /// Append to the database store, gated on HA role.
    ///
    /// Standby nodes share the database with the active node, so writes
    /// from them are refused rather than risking duplicate delivery.
    async fn write_database(
        &self,
        kind: RecordKind,
        record: CacheRecord,
    ) -> Result<u64, IngestError> {
        if !self.ha.is_active_node() {
            crate::metrics::record_ingest_error(kind.as_str(), "not_active_node");
            return Err(IngestError::NotActiveNode);
        }

        let Some(store) = self.store.as_deref() else {
            crate::metrics::record_ingest_error(kind.as_str(), "no_store");
            return Err(IngestError::BackendUnavailable(
                "no database store configured".to_string(),
            ));
        };

        match store.append(record).await {
            Ok(id) => {
                self.total_written.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_write(kind.as_str(), "database", "ok");
                debug!(id, "Buffered in database");
                Ok(id)
            }
            Err(BackendError::Unavailable(msg)) => {
                crate::metrics::record_write(kind.as_str(), "database", "error");
                crate::metrics::record_ingest_error(kind.as_str(), "backend_unavailable");
                Err(IngestError::BackendUnavailable(msg))
            }
            Err(e) => {
                crate::metrics::record_write(kind.as_str(), "database", "error");
                crate::metrics::record_ingest_error(kind.as_str(), "store_error");
                Err(IngestError::StoreError(e.to_string()))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Mode & Stats
    // ═══════════════════════════════════════════════════════════════════════════

    /// The cache mode currently in effect.
    ///
    /// This can differ from the configured mode after the automatic
    /// memory fallback has fired.
    #[must_use]
    #[inline]
    pub fn mode(&self) -> CacheMode {
        self.cache_state.mode()
    }

    /// Where a write of `kind` would go right now.
    ///
    /// Pure and non-blocking, safe to call from any producer thread.
    #[must_use]
    #[inline]
    pub fn current_destination(&self, kind: RecordKind) -> Destination {
        self.cache_state.current_destination(kind)
    }

    /// Whether the memory tier has been permanently abandoned.
    #[must_use]
    #[inline]
    pub fn has_fallen_back(&self) -> bool {
        self.cache_state.has_fallen_back()
    }

    /// Apply a mode change, returning the mode actually in effect.
    ///
    /// Transitions are serialized against each other and against the
    /// fallback latch. Requesting memory mode after the fallback has
    /// fired lands in database-only mode instead; the return value is
    /// the source of truth.
    pub fn transition(&self, requested: CacheMode) -> CacheMode {
        let applied = self.cache_state.transition(requested);
        if applied == requested {
            info!(mode = %applied, "Cache mode changed");
        } else {
            warn!(
                requested = %requested,
                applied = %applied,
                "Requested cache mode overridden by earlier memory fallback"
            );
        }
        crate::metrics::set_cache_mode(applied as u8);
        applied
    }

    /// Snapshot of cache health: mode, per-kind backlog and flush
    /// cursor, lifetime counters.
    ///
    /// Pending counts and cursor positions are best-effort reads
    /// against the live backends; a backend that cannot answer reports
    /// zero rather than failing the whole snapshot.
    pub async fn stats(&self) -> CacheStats {
        let mut per_kind = Vec::with_capacity(RecordKind::ALL.len());
        for kind in RecordKind::ALL {
            let destination = self.cache_state.current_destination(kind);
            let (pending, cursor) = match destination {
                Destination::Memory => (
                    self.memory.pending(kind).await.unwrap_or(0),
                    self.memory.load_cursor(kind).await.unwrap_or(0),
                ),
                Destination::Database => match self.store.as_deref() {
                    Some(store) => (
                        store.pending(kind).await.unwrap_or(0),
                        store.load_cursor(kind).await.unwrap_or(0),
                    ),
                    None => (0, 0),
                },
                Destination::None => (0, 0),
            };
            crate::metrics::set_pending_records(kind.as_str(), destination.as_str(), pending);
            per_kind.push(KindStats {
                kind,
                destination,
                pending,
                cursor,
            });
        }

        CacheStats {
            mode: self.cache_state.mode(),
            fell_back: self.cache_state.has_fallen_back(),
            per_kind,
            total_written: self.total_written.load(Ordering::Relaxed),
            total_flushed: self.total_flushed.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::create_test_cache;
    use super::*;
    use crate::config::PdcConfig;

    fn history(itemid: u64) -> RecordPayload {
        RecordPayload::History(HistoryPayload {
            itemid,
            value: "0".to_string(),
            ns: 0,
            state: 0,
        })
    }

    #[tokio::test]
    async fn test_write_rejects_mismatched_kind() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 10,
            ..Default::default()
        });

        let err = cache
            .write(RecordKind::Discovery, history(1), 100)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::UnsupportedKind {
                expected: RecordKind::Discovery,
                got: RecordKind::History,
            }
        ));
    }

    #[tokio::test]
    async fn test_write_disabled_mode_rejects() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Disabled,
            ..Default::default()
        });

        let err = cache
            .write(RecordKind::History, history(1), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::CacheDisabled));
        assert_eq!(
            cache.current_destination(RecordKind::History),
            Destination::None
        );
    }

    #[tokio::test]
    async fn test_memory_write_assigns_increasing_ids() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 10,
            ..Default::default()
        });

        let a = cache
            .write(RecordKind::History, history(1), 100)
            .await
            .unwrap();
        let b = cache
            .write(RecordKind::History, history(2), 101)
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_memory_failure_falls_back_permanently() {
        // Zero capacity makes the memory tier unusable on first write.
        // With no database store either, the producer gets an error, but
        // the mode must still have latched to database-only.
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 0,
            ..Default::default()
        });
        assert_eq!(cache.mode(), CacheMode::Memory);

        let err = cache
            .write(RecordKind::History, history(1), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::BackendUnavailable(_)));

        assert_eq!(cache.mode(), CacheMode::DatabaseOnly);
        assert!(cache.has_fallen_back());
        assert_eq!(
            cache.current_destination(RecordKind::History),
            Destination::Database
        );

        // Requesting memory mode again cannot undo the latch.
        assert_eq!(
            cache.transition(CacheMode::Memory),
            CacheMode::DatabaseOnly
        );
    }

    #[tokio::test]
    async fn test_database_mode_without_store_is_unavailable() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Database,
            ..Default::default()
        });

        let err = cache
            .write(RecordKind::History, history(1), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_typed_shorthands_route_by_kind() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 10,
            ..Default::default()
        });

        cache
            .write_history(
                HistoryPayload {
                    itemid: 1,
                    value: "up".to_string(),
                    ns: 0,
                    state: 0,
                },
                100,
            )
            .await
            .unwrap();
        cache
            .write_discovery(
                DiscoveryPayload {
                    druleid: 1,
                    dcheckid: 2,
                    ip: "192.168.0.1".to_string(),
                    dns: String::new(),
                    port: 161,
                    value: String::new(),
                    status: 0,
                },
                100,
            )
            .await
            .unwrap();

        let stats = cache.stats().await;
        let history = stats
            .per_kind
            .iter()
            .find(|k| k.kind == RecordKind::History)
            .unwrap();
        let discovery = stats
            .per_kind
            .iter()
            .find(|k| k.kind == RecordKind::Discovery)
            .unwrap();
        assert_eq!(history.pending, 1);
        assert_eq!(discovery.pending, 1);
        assert_eq!(stats.total_written, 2);
    }

    #[tokio::test]
    async fn test_stats_reflect_mode_and_fallback() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 5,
            ..Default::default()
        });

        let stats = cache.stats().await;
        assert_eq!(stats.mode, CacheMode::Memory);
        assert!(!stats.fell_back);
        assert_eq!(stats.per_kind.len(), 3);
        assert!(stats
            .per_kind
            .iter()
            .all(|k| k.destination == Destination::Memory && k.pending == 0 && k.cursor == 0));
    }
}
