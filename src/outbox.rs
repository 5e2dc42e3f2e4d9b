//! Local outbox store: the durable queue every field mutation goes through
//! before it reaches the server.
//!
//! The store is the only writer of the `outbox` table. After every mutation it
//! republishes [`OutboxCounts`] so the UI can show "N pending" and
//! "N items need attention" without polling.

use crate::db::{self, Pool};
use crate::model::{OutboxKind, OutboxPayload, OutboxRecord, SyncState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    /// Not yet acknowledged by the server (pending or in flight).
    pub pending: i64,
    /// Terminally failed; needs a human.
    pub failed: i64,
}

#[derive(Clone)]
pub struct OutboxStore {
    pool: Pool,
    counts: Arc<watch::Sender<OutboxCounts>>,
}

impl OutboxStore {
    pub async fn open(pool: Pool) -> Result<Self> {
        let (tx, _rx) = watch::channel(OutboxCounts::default());
        let store = Self {
            pool,
            counts: Arc::new(tx),
        };
        store.refresh_counts().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn subscribe(&self) -> watch::Receiver<OutboxCounts> {
        self.counts.subscribe()
    }

    pub fn counts(&self) -> OutboxCounts {
        *self.counts.borrow()
    }

    /// Record a mutation captured now. Purely local.
    pub async fn enqueue(&self, payload: OutboxPayload) -> Result<OutboxRecord> {
        self.enqueue_at(payload, Utc::now()).await
    }

    /// Record a mutation with an explicit capture time.
    #[instrument(skip_all)]
    pub async fn enqueue_at(
        &self,
        payload: OutboxPayload,
        created_at: DateTime<Utc>,
    ) -> Result<OutboxRecord> {
        let record = OutboxRecord {
            id: Uuid::new_v4(),
            kind: payload.kind(),
            payload,
            // Stored with microsecond precision; keep the in-memory copy identical.
            created_at: db::model::from_micros(db::model::to_micros(created_at))?,
            sync_state: SyncState::Pending,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: None,
            syncing_since: None,
        };
        db::insert_outbox(&self.pool, &record).await?;
        info!(id = %record.id, kind = %record.kind, "outbox record queued");
        self.refresh_counts().await?;
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        db::fetch_outbox(&self.pool, id).await
    }

    /// Pending records ordered by kind, then capture time.
    pub async fn list_pending(&self) -> Result<Vec<OutboxRecord>> {
        db::list_outbox_by_state(&self.pool, SyncState::Pending).await
    }

    pub async fn list_failed(&self) -> Result<Vec<OutboxRecord>> {
        db::list_outbox_by_state(&self.pool, SyncState::Failed).await
    }

    /// Claim records for a batch. Returns the ids actually claimed; a record
    /// another drain pass holds is not returned.
    pub async fn mark_syncing(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        db::mark_outbox_syncing(&self.pool, ids, Utc::now()).await
    }

    /// Pending or in-flight records of `kind`, oldest first.
    pub async fn list_unsettled(&self, kind: OutboxKind) -> Result<Vec<OutboxRecord>> {
        db::list_outbox_unsettled(&self.pool, kind).await
    }

    /// Idempotent; a second call for the same id is a no-op.
    pub async fn mark_synced(&self, id: Uuid) -> Result<()> {
        if db::mark_outbox_synced(&self.pool, id, Utc::now()).await? {
            self.refresh_counts().await?;
        }
        Ok(())
    }

    /// Idempotent; never touches a record the server already acknowledged.
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()> {
        if db::mark_outbox_failed(&self.pool, id, reason).await? {
            self.refresh_counts().await?;
        }
        Ok(())
    }

    pub async fn requeue(&self, id: Uuid, error: &str, next_attempt_at: DateTime<Utc>) -> Result<()> {
        db::requeue_outbox(&self.pool, id, error, next_attempt_at).await?;
        Ok(())
    }

    /// Return records stuck in flight for longer than `older_than` to pending.
    pub async fn revert_stale_syncing(&self, older_than: Duration) -> Result<u64> {
        let older_than = chrono::Duration::from_std(older_than)?;
        let reverted = db::revert_stale_syncing(&self.pool, Utc::now() - older_than).await?;
        if reverted > 0 {
            info!(reverted, "reverted stuck outbox records to pending");
        }
        Ok(reverted)
    }

    /// Operator-initiated retry of failed records; `None` retries all of them.
    pub async fn retry_failed(&self, ids: Option<&[Uuid]>) -> Result<u64> {
        let moved = db::retry_failed_outbox(&self.pool, ids).await?;
        if moved > 0 {
            info!(moved, "failed outbox records queued for retry");
            self.refresh_counts().await?;
        }
        Ok(moved)
    }

    /// Delete acknowledged records. Failed records are never deleted.
    pub async fn purge_synced(&self) -> Result<u64> {
        db::purge_synced_outbox(&self.pool).await
    }

    async fn refresh_counts(&self) -> Result<()> {
        let pending = db::count_outbox_by_state(&self.pool, SyncState::Pending).await?
            + db::count_outbox_by_state(&self.pool, SyncState::Syncing).await?;
        let failed = db::count_outbox_by_state(&self.pool, SyncState::Failed).await?;
        self.counts.send_if_modified(|current| {
            let next = OutboxCounts { pending, failed };
            let changed = *current != next;
            *current = next;
            changed
        });
        Ok(())
    }
}
