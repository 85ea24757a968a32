//! Flush engine internals: drain, deliver, acknowledge.
//!
//! Each pass over a kind is one `flush_kind_once()` call holding that
//! kind's flush lock, so there is never more than one in-flight batch
//! per kind and the cursor only ever advances behind an acknowledged
//! batch. Passes over different kinds run concurrently.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::collector::{DeliveryBatch, DeliveryError};
use crate::record::RecordKind;
use crate::state::Destination;
use crate::storage::{Backend, BackendError};

use super::types::{FlushError, FlushOutcome};
use super::ProxyDataCache;

impl ProxyDataCache {
    // ═══════════════════════════════════════════════════════════════════════════
    // Flush: one pass per kind
    // ═══════════════════════════════════════════════════════════════════════════

    /// One drain → deliver → acknowledge pass against the destination
    /// the current mode selects for `kind`.
    pub(super) async fn flush_kind_once(
        &self,
        kind: RecordKind,
    ) -> Result<FlushOutcome, FlushError> {
        match self.cache_state.current_destination(kind) {
            Destination::None => Ok(FlushOutcome::Disabled),
            Destination::Memory => {
                self.flush_once_on(kind, Destination::Memory, &self.memory)
                    .await
            }
            Destination::Database => match self.store.as_deref() {
                Some(store) => self.flush_once_on(kind, Destination::Database, store).await,
                None => Err(FlushError::Store(BackendError::Unavailable(
                    "no database store configured".to_string(),
                ))),
            },
        }
    }

    /// One drain → deliver → acknowledge pass for `kind` against one
    /// backend.
    ///
    /// Drains at most `max_batch` records past the cursor, hands them
    /// to the collector and, once acknowledged, purges them and
    /// advances the cursor to the batch's last id. A failed delivery
    /// retries the identical batch with exponential backoff; after
    /// `delivery_max_attempts` tries the records stay in place for the
    /// next cycle.
    async fn flush_once_on(
        &self,
        kind: RecordKind,
        destination: Destination,
        backend: &dyn Backend,
    ) -> Result<FlushOutcome, FlushError> {
        let lock = self.flush_lock(kind);
        let _guard = lock.lock().await;

        if *self.shutdown_rx.borrow() {
            return Ok(FlushOutcome::Stopped);
        }
        if !self.ha.is_active_node() {
            return Ok(FlushOutcome::NotActive);
        }

        let (max_batch, timeout, max_attempts, backoff, backoff_max) = {
            let config = self.config.read();
            (
                config.max_batch,
                Duration::from_millis(config.delivery_timeout_ms),
                config.delivery_max_attempts.max(1),
                Duration::from_millis(config.delivery_backoff_ms),
                Duration::from_millis(config.delivery_backoff_max_ms),
            )
        };

        // ====== Drain the next batch past the cursor ======
        let cursor = match backend.load_cursor(kind).await {
            Ok(cursor) => cursor,
            Err(e) => {
                crate::metrics::record_drain_error(kind.as_str());
                return Err(FlushError::Store(e));
            }
        };
        let records = match backend.drain(kind, cursor, max_batch).await {
            Ok(records) => records,
            Err(e) => {
                crate::metrics::record_drain_error(kind.as_str());
                return Err(FlushError::Store(e));
            }
        };
        if records.is_empty() {
            return Ok(FlushOutcome::Idle);
        }

        let batch = DeliveryBatch::new(kind, records);
        let count = batch.len();
        let last_id = batch.last_id().unwrap_or(cursor);
        debug!(
            kind = %kind,
            destination = %destination,
            count,
            first_id = batch.first_id().unwrap_or(0),
            last_id,
            "Drained batch for delivery"
        );

        // ====== Deliver, re-sending the identical batch on failure ======
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut delay = backoff;
        let mut attempts = 0usize;
        loop {
            attempts += 1;

            let attempt_start = std::time::Instant::now();
            let err = match tokio::time::timeout(timeout, self.collector.deliver(&batch)).await {
                Ok(Ok(())) => {
                    crate::metrics::record_delivery_latency(kind.as_str(), attempt_start.elapsed());
                    return self.acknowledge(kind, backend, &batch, count, last_id).await;
                }
                Ok(Err(e)) => e,
                Err(_) => DeliveryError::Timeout(timeout),
            };

            let reason = match &err {
                DeliveryError::Timeout(_) => "timeout",
                DeliveryError::Rejected(_) => "rejected",
                DeliveryError::Transport(_) => "transport",
            };
            crate::metrics::record_delivery_retry(kind.as_str(), reason);

            if attempts >= max_attempts {
                crate::metrics::record_flush_batch(kind.as_str(), "failed");
                warn!(
                    kind = %kind,
                    attempts,
                    error = %err,
                    "Giving up on batch until the next flush cycle, records stay buffered"
                );
                return Err(FlushError::Delivery {
                    attempts,
                    last: err,
                });
            }

            warn!(
                kind = %kind,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Delivery failed, backing off before re-sending the same batch"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return Ok(FlushOutcome::Stopped),
            }
            delay = (delay.mul_f64(2.0)).min(backoff_max);

            if *shutdown_rx.borrow() {
                return Ok(FlushOutcome::Stopped);
            }
            if !self.ha.is_active_node() {
                info!(
                    kind = %kind,
                    "Lost active role mid-flush, leaving batch for the next active node"
                );
                return Ok(FlushOutcome::NotActive);
            }
        }
    }

    /// Purge delivered records, then advance the cursor.
    ///
    /// In that order: if the process dies between the two, the rows are
    /// already gone and the stale cursor is harmless. The other order
    /// would strand delivered rows in the table forever.
    async fn acknowledge(
        &self,
        kind: RecordKind,
        backend: &dyn Backend,
        batch: &DeliveryBatch,
        count: usize,
        last_id: u64,
    ) -> Result<FlushOutcome, FlushError> {
        let removed = match backend.purge(kind, &batch.ids()).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(
                    kind = %kind,
                    count,
                    error = %e,
                    "Batch delivered but purge failed, it may be re-sent next cycle"
                );
                return Err(FlushError::Store(e));
            }
        };
        if let Err(e) = backend.store_cursor(kind, last_id).await {
            error!(
                kind = %kind,
                last_id,
                error = %e,
                "Batch delivered and purged but cursor not advanced"
            );
            return Err(FlushError::Store(e));
        }

        self.total_flushed.fetch_add(count as u64, Ordering::Relaxed);
        crate::metrics::record_flushed_records(kind.as_str(), count);
        crate::metrics::record_flush_batch(kind.as_str(), "delivered");
        debug!(kind = %kind, count, removed, last_id, "Batch acknowledged");

        Ok(FlushOutcome::Delivered {
            records: count,
            last_id,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Flush: whole-backlog passes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Flush `kind` until its backlog is drained or a pass stops short.
    ///
    /// A fallback can leave records in the memory tier while new writes
    /// route to the database. The memory tier keeps its own cursor and
    /// id space, so it drains first, then the live destination.
    ///
    /// Returns the number of records delivered. Errors are logged, not
    /// propagated: the records stay buffered and the next cycle tries
    /// again.
    pub(super) async fn flush_kind_backlog(&self, kind: RecordKind) -> usize {
        let mut delivered = 0usize;

        if self.cache_state.current_destination(kind) == Destination::Database
            && self.memory.pending(kind).await.unwrap_or(0) > 0
        {
            delivered += self
                .drain_backlog_on(kind, Destination::Memory, &self.memory)
                .await;
        }

        loop {
            match self.flush_kind_once(kind).await {
                Ok(FlushOutcome::Delivered { records, .. }) => {
                    delivered += records;
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Flush pass ended early");
                    break;
                }
            }
        }
        delivered
    }

    /// Repeat passes against one backend until it stops delivering.
    async fn drain_backlog_on(
        &self,
        kind: RecordKind,
        destination: Destination,
        backend: &dyn Backend,
    ) -> usize {
        let mut delivered = 0usize;
        loop {
            match self.flush_once_on(kind, destination, backend).await {
                Ok(FlushOutcome::Delivered { records, .. }) => {
                    delivered += records;
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(
                        kind = %kind,
                        destination = %destination,
                        error = %e,
                        "Flush pass ended early"
                    );
                    break;
                }
            }
        }
        delivered
    }

    /// One flush pass over every kind, kinds running concurrently.
    pub(super) async fn flush_pass(&self) -> usize {
        let (autoreg, history, discovery) = tokio::join!(
            self.flush_kind_backlog(RecordKind::Autoregistration),
            self.flush_kind_backlog(RecordKind::History),
            self.flush_kind_backlog(RecordKind::Discovery),
        );
        let total = autoreg + history + discovery;
        if total > 0 {
            debug!(autoreg, history, discovery, "Flush pass delivered records");
        }
        total
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Maintenance: retention sweep
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drop unacknowledged records older than the retention horizon.
    ///
    /// Does nothing when `retention_hours` is 0. Anything discarded
    /// here was never acknowledged upstream, so it is logged as data
    /// loss. The cursor is untouched: later drains simply no longer
    /// see the deleted rows.
    pub(super) async fn expire_tick(&self) {
        let retention_hours = self.config.read().retention_hours;
        if retention_hours == 0 {
            return;
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let horizon = now - (retention_hours as i64) * 3600;

        for kind in RecordKind::ALL {
            let backend: &dyn Backend = match self.cache_state.current_destination(kind) {
                Destination::None => continue,
                Destination::Memory => &self.memory,
                Destination::Database => match self.store.as_deref() {
                    Some(store) => store,
                    None => continue,
                },
            };

            match backend.expire(kind, horizon).await {
                Ok(0) => {}
                Ok(discarded) => {
                    self.total_expired.fetch_add(discarded, Ordering::Relaxed);
                    crate::metrics::record_expired(kind.as_str(), discarded);
                    warn!(
                        kind = %kind,
                        discarded,
                        horizon,
                        retention_hours,
                        "Dropped unacknowledged records past the retention horizon, \
                         they will never reach the server"
                    );
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Retention sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::create_test_cache;
    use super::*;
    use crate::config::PdcConfig;
    use crate::record::{HistoryPayload, RecordPayload};
    use crate::state::CacheMode;

    fn history(itemid: u64) -> RecordPayload {
        RecordPayload::History(HistoryPayload {
            itemid,
            value: itemid.to_string(),
            ns: 0,
            state: 0,
        })
    }

    fn memory_config() -> PdcConfig {
        PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_flush_empty_backlog_is_idle() {
        let cache = create_test_cache(memory_config());
        let outcome = cache.flush_kind_once(RecordKind::History).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Idle);
    }

    #[tokio::test]
    async fn test_flush_disabled_mode_is_disabled() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Disabled,
            ..Default::default()
        });
        let outcome = cache.flush_kind_once(RecordKind::History).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_flush_delivers_and_purges() {
        let cache = create_test_cache(memory_config());
        for i in 0..5 {
            cache
                .write(RecordKind::History, history(i), 100 + i as i64)
                .await
                .unwrap();
        }

        let outcome = cache.flush_kind_once(RecordKind::History).await.unwrap();
        match outcome {
            FlushOutcome::Delivered { records, last_id } => {
                assert_eq!(records, 5);
                assert!(last_id >= 5);
            }
            other => panic!("expected Delivered, got {other:?}"),
        }

        // Acknowledged records are gone and the next pass has nothing.
        let stats = cache.stats().await;
        let pending = stats
            .per_kind
            .iter()
            .find(|k| k.kind == RecordKind::History)
            .unwrap()
            .pending;
        assert_eq!(pending, 0);
        assert_eq!(
            cache.flush_kind_once(RecordKind::History).await.unwrap(),
            FlushOutcome::Idle
        );
    }

    #[tokio::test]
    async fn test_flush_respects_max_batch() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 100,
            max_batch: 3,
            ..Default::default()
        });
        for i in 0..7 {
            cache
                .write(RecordKind::History, history(i), 100)
                .await
                .unwrap();
        }

        match cache.flush_kind_once(RecordKind::History).await.unwrap() {
            FlushOutcome::Delivered { records, .. } => assert_eq!(records, 3),
            other => panic!("expected Delivered, got {other:?}"),
        }

        // Backlog pass drains the rest in further batches.
        let delivered = cache.flush_kind_backlog(RecordKind::History).await;
        assert_eq!(delivered, 4);
    }

    #[tokio::test]
    async fn test_flush_pass_covers_all_kinds() {
        let cache = create_test_cache(memory_config());
        cache
            .write(RecordKind::History, history(1), 100)
            .await
            .unwrap();
        cache
            .write_discovery(
                crate::record::DiscoveryPayload {
                    druleid: 1,
                    dcheckid: 1,
                    ip: "10.0.0.9".to_string(),
                    dns: String::new(),
                    port: 80,
                    value: String::new(),
                    status: 0,
                },
                100,
            )
            .await
            .unwrap();

        assert_eq!(cache.flush_pass().await, 2);
        assert_eq!(cache.flush_pass().await, 0);
    }

    #[tokio::test]
    async fn test_fallback_leftovers_still_flush() {
        // Fill a tiny memory buffer, then overflow it so the mode
        // latches to database-only with two records still in memory.
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 2,
            ..Default::default()
        });
        cache
            .write(RecordKind::History, history(1), 100)
            .await
            .unwrap();
        cache
            .write(RecordKind::History, history(2), 101)
            .await
            .unwrap();
        // Overflow: no database store either, so the producer sees an
        // error, but the latch has flipped.
        cache
            .write(RecordKind::History, history(3), 102)
            .await
            .unwrap_err();
        assert!(cache.has_fallen_back());

        // The two buffered records are not stranded: the backlog pass
        // sweeps the memory tier even though writes now route to the
        // database.
        assert_eq!(cache.flush_kind_backlog(RecordKind::History).await, 2);
        let stats = cache.stats().await;
        assert_eq!(stats.total_flushed, 2);
    }

    #[tokio::test]
    async fn test_expire_tick_disabled_by_default() {
        let cache = create_test_cache(memory_config());
        cache
            .write(RecordKind::History, history(1), 1)
            .await
            .unwrap();

        // retention_hours = 0 keeps everything.
        cache.expire_tick().await;
        let stats = cache.stats().await;
        assert_eq!(stats.total_expired, 0);
        assert_eq!(
            stats
                .per_kind
                .iter()
                .find(|k| k.kind == RecordKind::History)
                .unwrap()
                .pending,
            1
        );
    }

    #[tokio::test]
    async fn test_expire_tick_drops_old_records() {
        let cache = create_test_cache(PdcConfig {
            mode: CacheMode::Memory,
            memory_capacity: 100,
            retention_hours: 1,
            ..Default::default()
        });

        // clock 1 is hours in the past; a current clock survives.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        cache
            .write(RecordKind::History, history(1), 1)
            .await
            .unwrap();
        cache
            .write(RecordKind::History, history(2), now)
            .await
            .unwrap();

        cache.expire_tick().await;

        let stats = cache.stats().await;
        assert_eq!(stats.total_expired, 1);
        assert_eq!(
            stats
                .per_kind
                .iter()
                .find(|k| k.kind == RecordKind::History)
                .unwrap()
                .pending,
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_flush_before_drain() {
        let cache = create_test_cache(memory_config());
        cache
            .write(RecordKind::History, history(1), 100)
            .await
            .unwrap();

        cache.shutdown.send_replace(true);
        assert_eq!(
            cache.flush_kind_once(RecordKind::History).await.unwrap(),
            FlushOutcome::Stopped
        );
    }
}
