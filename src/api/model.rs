//! Wire types shared by the HTTP client and the sync server.

use crate::model::{GeoFix, OutboxKind, OutboxPayload, OutboxRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// One outbox record on the wire. `client_id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRecord {
    pub client_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub payload: OutboxPayload,
}

impl From<&OutboxRecord> for SyncRecord {
    fn from(rec: &OutboxRecord) -> Self {
        Self {
            client_id: rec.id,
            created_at: rec.created_at,
            payload: rec.payload.clone(),
        }
    }
}

/// All records of a single kind, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncBatch {
    pub kind: OutboxKind,
    pub device_id: String,
    pub records: Vec<SyncRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Applied,
    Duplicate,
    Rejected,
}

/// Why the server refused a record. Every variant is terminal for that record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientStock { available: i64, requested: i64 },
    UnknownInventoryItem { inventory_item_id: Uuid },
    KindMismatch { expected: OutboxKind, found: OutboxKind },
    InvalidPayload { message: String },
    VisitState { message: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientStock { available, requested } => write!(
                f,
                "insufficient stock: requested {} but only {} available",
                requested, available
            ),
            RejectReason::UnknownInventoryItem { inventory_item_id } => {
                write!(f, "unknown inventory item {}", inventory_item_id)
            }
            RejectReason::KindMismatch { expected, found } => {
                write!(f, "record of kind {} sent in a {} batch", found, expected)
            }
            RejectReason::InvalidPayload { message } => write!(f, "invalid payload: {}", message),
            RejectReason::VisitState { message } => write!(f, "visit state: {}", message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordResult {
    pub client_id: Uuid,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    /// What the effect produced (e.g. remaining stock). Replays echo the
    /// result of the original application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl RecordResult {
    pub fn applied(client_id: Uuid) -> Self {
        Self { client_id, status: RecordStatus::Applied, reason: None, result: None }
    }

    pub fn duplicate(client_id: Uuid) -> Self {
        Self { client_id, status: RecordStatus::Duplicate, reason: None, result: None }
    }

    pub fn rejected(client_id: Uuid, reason: RejectReason) -> Self {
        Self { client_id, status: RecordStatus::Rejected, reason: Some(reason), result: None }
    }

    pub fn with_result(mut self, result: Option<Value>) -> Self {
        self.result = result;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncBatchResponse {
    pub results: Vec<RecordResult>,
}

/// Latest position of a practitioner; overwrites the previous one server-side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl From<GeoFix> for LocationUpdate {
    fn from(fix: GeoFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            recorded_at: fix.timestamp,
        }
    }
}
