//! Applies sync batches from field devices.
//!
//! Records are applied in the order received, each in its own transaction:
//! claim `(kind, client_id)`, apply the effect, commit. A replayed record
//! finds its claim taken and is answered `duplicate` with the stored result
//! of the first application, without touching anything else.

use crate::api::{RecordResult, RejectReason, SyncBatch, SyncBatchResponse, SyncRecord};
use crate::db::Pool;
use crate::model::{OutboxKind, OutboxPayload};
use crate::server::inventory::{self, UsageOutcome};
use crate::server::ledger;
use crate::server::visits::{self, Effect};
use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct SyncIngest {
    pool: Pool,
}

impl SyncIngest {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(kind = %batch.kind, device_id = %batch.device_id, records = batch.records.len()))]
    pub async fn apply_batch(&self, batch: &SyncBatch) -> Result<SyncBatchResponse> {
        let mut results = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            results.push(self.apply_record(batch.kind, &batch.device_id, record).await?);
        }
        let applied = results
            .iter()
            .filter(|r| r.status == crate::api::RecordStatus::Applied)
            .count();
        info!(applied, total = results.len(), "batch ingested");
        Ok(SyncBatchResponse { results })
    }

    pub async fn apply_record(
        &self,
        kind: OutboxKind,
        device_id: &str,
        record: &SyncRecord,
    ) -> Result<RecordResult> {
        let client_id = record.client_id;
        if record.payload.kind() != kind {
            return Ok(RecordResult::rejected(
                client_id,
                RejectReason::KindMismatch {
                    expected: kind,
                    found: record.payload.kind(),
                },
            ));
        }

        let mut tx = self.pool.begin().await?;
        if !ledger::claim(&mut tx, kind, client_id, Some(device_id)).await? {
            let prior = ledger::prior_result(&mut tx, kind, client_id).await?;
            tx.rollback().await?;
            debug!(%client_id, %kind, "replay of applied record");
            return Ok(RecordResult::duplicate(client_id).with_result(prior));
        }

        let mut result = json!({});
        let effect = match &record.payload {
            OutboxPayload::Vital(v) => {
                result = json!({ "booking_id": v.booking_id, "recorded_at": v.recorded_at });
                visits::record_vitals(&mut tx, client_id, v).await?
            }
            OutboxPayload::InventoryUsage(u) => {
                let outcome = inventory::decrement(
                    &mut tx,
                    u.inventory_item_id,
                    u.quantity_used,
                    client_id,
                    u.booking_id,
                )
                .await?;
                match outcome {
                    UsageOutcome::Applied { quantity } | UsageOutcome::Duplicate { quantity } => {
                        result = json!({ "quantity": quantity });
                        Effect::Applied
                    }
                    UsageOutcome::InsufficientStock { available, requested } => {
                        Effect::Rejected(RejectReason::InsufficientStock { available, requested })
                    }
                    UsageOutcome::UnknownItem => Effect::Rejected(RejectReason::UnknownInventoryItem {
                        inventory_item_id: u.inventory_item_id,
                    }),
                    UsageOutcome::InvalidQuantity { requested } => {
                        Effect::Rejected(RejectReason::InvalidPayload {
                            message: format!("quantity_used must be positive, got {}", requested),
                        })
                    }
                }
            }
            OutboxPayload::VisitCheckIn(e) => {
                result = json!({ "booking_id": e.booking_id, "check_in_time": e.timestamp });
                visits::check_in(&mut tx, e.booking_id, e.timestamp).await?
            }
            OutboxPayload::VisitCheckOut(e) => {
                result = json!({ "booking_id": e.booking_id, "check_out_time": e.timestamp });
                visits::check_out(&mut tx, e.booking_id, e.timestamp).await?
            }
        };

        match effect {
            Effect::Applied => {
                ledger::record_result(&mut tx, kind, client_id, &result).await?;
                tx.commit().await?;
                Ok(RecordResult::applied(client_id).with_result(Some(result)))
            }
            Effect::Rejected(reason) => {
                tx.rollback().await?;
                warn!(%client_id, %kind, %reason, "record rejected");
                Ok(RecordResult::rejected(client_id, reason))
            }
        }
    }
}
