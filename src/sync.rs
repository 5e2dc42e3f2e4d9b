//! Drains the local outbox against the sync server.
//!
//! A drain pass groups due records by kind and sends one batch per kind,
//! oldest first. Per-record results decide the next state:
//!
//! | server says            | outbox state                                  |
//! |------------------------|-----------------------------------------------|
//! | applied / duplicate    | `synced`                                      |
//! | rejected               | `failed` (waits for an operator retry)        |
//! | transient error        | `pending` with backoff, `failed` at the cap   |
//! | whole batch refused    | `failed` for every record in the batch        |
//!
//! Only one pass runs at a time; a trigger that arrives while a pass is in
//! flight is coalesced into it. Records another process already claimed are
//! left to that process.
//!
//! Check-ins are sent before check-outs, and a check-out waits while the
//! check-in of the same booking is still pending or in flight.

use crate::api::{ApiError, RecordResult, RecordStatus, SyncApi, SyncBatch, SyncRecord};
use crate::config::{Config, RetryPolicy};
use crate::connectivity::Connectivity;
use crate::model::{OutboxKind, OutboxRecord};
use crate::outbox::OutboxStore;
use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub device_id: String,
    /// Upper bound for one batch request; also the watchdog threshold for stuck records.
    pub batch_timeout: Duration,
    pub max_batch_size: usize,
    pub retry: RetryPolicy,
    /// Retry/watchdog tick while the engine is running.
    pub poll_interval: Duration,
}

impl SyncOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            device_id: cfg.app.device_id.clone(),
            batch_timeout: Duration::from_millis(cfg.sync.batch_timeout_ms),
            max_batch_size: cfg.sync.max_batch_size,
            retry: cfg.retry_policy(),
            poll_interval: Duration::from_millis(cfg.sync.poll_interval_ms),
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another pass was already running; nothing was sent.
    pub coalesced: bool,
    pub batches: usize,
    pub synced: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub requeued: usize,
    /// Pending records held back (backoff, an earlier record of the same kind
    /// waiting, or a check-out whose check-in has not synced).
    pub deferred: usize,
    /// Records another drain pass claimed first.
    pub skipped: usize,
    pub reverted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Continue,
    /// Transient trouble; later records of this kind wait for the next pass.
    Retry,
}

#[derive(Clone)]
pub struct SyncEngine {
    store: OutboxStore,
    api: Arc<dyn SyncApi>,
    opts: SyncOptions,
    syncing: Arc<AtomicBool>,
    syncing_tx: Arc<watch::Sender<bool>>,
}

/// Holds the single-pass flag; dropping it releases the flag even on error paths.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
    tx: &'a watch::Sender<bool>,
}

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool, tx: &'a watch::Sender<bool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        tx.send_replace(true);
        Some(Self { flag, tx })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.tx.send_replace(false);
    }
}

impl SyncEngine {
    pub fn new(store: OutboxStore, api: Arc<dyn SyncApi>, opts: SyncOptions) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            store,
            api,
            opts,
            syncing: Arc::new(AtomicBool::new(false)),
            syncing_tx: Arc::new(tx),
        }
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.syncing_tx.subscribe()
    }

    /// One drain pass over every due pending record.
    #[instrument(skip_all)]
    pub async fn sync_pending_data(&self) -> Result<DrainReport> {
        let Some(_guard) = PassGuard::acquire(&self.syncing, &self.syncing_tx) else {
            debug!("drain already in flight; coalescing trigger");
            return Ok(DrainReport {
                coalesced: true,
                ..Default::default()
            });
        };

        let mut report = DrainReport {
            reverted: self.store.revert_stale_syncing(self.opts.batch_timeout).await?,
            ..Default::default()
        };

        let now = Utc::now();
        let mut by_kind: BTreeMap<OutboxKind, Vec<OutboxRecord>> = BTreeMap::new();
        for rec in self.store.list_pending().await? {
            by_kind.entry(rec.kind).or_default().push(rec);
        }

        for (kind, records) in by_kind {
            let open_check_ins = if kind == OutboxKind::VisitCheckOut {
                self.open_check_ins().await?
            } else {
                HashSet::new()
            };
            // Per-kind FIFO: nothing may overtake a record that is still waiting.
            let due = records
                .iter()
                .take_while(|r| {
                    r.is_due(now)
                        && !r
                            .payload
                            .booking_id()
                            .is_some_and(|b| open_check_ins.contains(&b))
                })
                .count();
            if due < records.len() && !open_check_ins.is_empty() {
                debug!(held = records.len() - due, "check-outs waiting on their check-in");
            }
            let mut sent = 0;
            for chunk in records[..due].chunks(self.opts.max_batch_size.max(1)) {
                sent += chunk.len();
                if self.submit_chunk(kind, chunk, &mut report).await? == ChunkOutcome::Retry {
                    break;
                }
            }
            report.deferred += records.len() - sent;
        }

        self.store.purge_synced().await?;
        if report.batches > 0 || report.reverted > 0 {
            info!(
                batches = report.batches,
                synced = report.synced,
                duplicates = report.duplicates,
                failed = report.failed,
                requeued = report.requeued,
                deferred = report.deferred,
                skipped = report.skipped,
                "drain pass finished"
            );
        }
        Ok(report)
    }

    async fn submit_chunk(
        &self,
        kind: OutboxKind,
        chunk: &[OutboxRecord],
        report: &mut DrainReport,
    ) -> Result<ChunkOutcome> {
        let ids: Vec<Uuid> = chunk.iter().map(|r| r.id).collect();
        let claimed: HashSet<Uuid> = self.store.mark_syncing(&ids).await?.into_iter().collect();
        let chunk: Vec<&OutboxRecord> = chunk.iter().filter(|r| claimed.contains(&r.id)).collect();
        let skipped = ids.len() - chunk.len();
        if skipped > 0 {
            warn!(%kind, skipped, "records already claimed by another drain pass");
            report.skipped += skipped;
        }
        if chunk.is_empty() {
            // Whoever holds them decides their order; later records wait.
            return Ok(ChunkOutcome::Retry);
        }
        report.batches += 1;

        let batch = SyncBatch {
            kind,
            device_id: self.opts.device_id.clone(),
            records: chunk.iter().map(|r| SyncRecord::from(*r)).collect(),
        };
        debug!(%kind, records = batch.records.len(), "submitting batch");

        let result = match tokio::time::timeout(self.opts.batch_timeout, self.api.submit_batch(&batch)).await {
            Ok(res) => res,
            Err(_) => Err(ApiError::Transient(format!(
                "batch timed out after {} ms",
                self.opts.batch_timeout.as_millis()
            ))),
        };

        match result {
            Ok(resp) => {
                let mut by_id: HashMap<Uuid, RecordResult> = resp
                    .results
                    .into_iter()
                    .map(|r| (r.client_id, r))
                    .collect();
                let mut outcome = if skipped > 0 {
                    ChunkOutcome::Retry
                } else {
                    ChunkOutcome::Continue
                };
                for rec in chunk.iter().copied() {
                    match by_id.remove(&rec.id) {
                        Some(RecordResult { status: RecordStatus::Applied, .. }) => {
                            self.store.mark_synced(rec.id).await?;
                            report.synced += 1;
                        }
                        Some(RecordResult { status: RecordStatus::Duplicate, .. }) => {
                            self.store.mark_synced(rec.id).await?;
                            report.duplicates += 1;
                        }
                        Some(RecordResult { status: RecordStatus::Rejected, reason, .. }) => {
                            let reason = reason
                                .map(|r| r.to_string())
                                .unwrap_or_else(|| "rejected by server".to_string());
                            warn!(id = %rec.id, %kind, %reason, "record rejected; needs attention");
                            self.store.mark_failed(rec.id, &reason).await?;
                            report.failed += 1;
                        }
                        None => {
                            self.retry_later(rec, "server returned no result for record", report)
                                .await?;
                            outcome = ChunkOutcome::Retry;
                        }
                    }
                }
                Ok(outcome)
            }
            Err(err) if err.is_transient() => {
                warn!(?err, %kind, records = chunk.len(), "batch failed; will retry");
                for rec in chunk.iter().copied() {
                    self.retry_later(rec, &err.to_string(), report).await?;
                }
                Ok(ChunkOutcome::Retry)
            }
            Err(err) => {
                error!(?err, %kind, records = chunk.len(), "batch refused by server");
                let reason = err.to_string();
                for rec in chunk.iter().copied() {
                    self.store.mark_failed(rec.id, &reason).await?;
                    report.failed += 1;
                }
                Ok(ChunkOutcome::Continue)
            }
        }
    }

    async fn retry_later(&self, rec: &OutboxRecord, error: &str, report: &mut DrainReport) -> Result<()> {
        let attempts = rec.attempt_count.saturating_add(1);
        if attempts >= self.opts.retry.max_attempts {
            let reason = format!("gave up after {} attempts: {}", attempts, error);
            warn!(id = %rec.id, kind = %rec.kind, attempts, "retry budget exhausted");
            self.store.mark_failed(rec.id, &reason).await?;
            report.failed += 1;
            return Ok(());
        }
        let delay = chrono::Duration::from_std(self.opts.retry.delay_for(rec.attempt_count))?;
        self.store.requeue(rec.id, error, Utc::now() + delay).await?;
        report.requeued += 1;
        Ok(())
    }

    /// Bookings whose check-in the server has not acknowledged yet.
    async fn open_check_ins(&self) -> Result<HashSet<Uuid>> {
        Ok(self
            .store
            .list_unsettled(OutboxKind::VisitCheckIn)
            .await?
            .iter()
            .filter_map(|r| r.payload.booking_id())
            .collect())
    }

    /// Revert stuck in-flight records unless a pass is running right now.
    pub async fn watchdog(&self) -> Result<u64> {
        if self.is_syncing() {
            return Ok(0);
        }
        self.store.revert_stale_syncing(self.opts.batch_timeout).await
    }

    async fn drain_logged(&self) {
        if let Err(err) = self.sync_pending_data().await {
            error!(?err, "drain pass failed");
        }
    }

    /// Drain on every transition to online and on each tick while online.
    pub async fn run(
        &self,
        mut connectivity: watch::Receiver<Connectivity>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.opts.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *connectivity.borrow_and_update() == Connectivity::Online;
                    if online {
                        info!("back online; draining outbox");
                        self.drain_logged().await;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.watchdog().await {
                        error!(?err, "outbox watchdog failed");
                    }
                    let online = *connectivity.borrow() == Connectivity::Online;
                    if online {
                        self.drain_logged().await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
