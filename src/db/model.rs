//! Row types returned by repository queries and their conversion into domain
//! entities.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{OutboxKind, OutboxPayload, OutboxRecord, SyncState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Raw `outbox` row as stored by SQLite.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub created_at: i64,
    pub sync_state: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<i64>,
    pub syncing_since: Option<i64>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = anyhow::Error;

    fn try_from(row: OutboxRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id).with_context(|| format!("bad outbox id {}", row.id))?;
        let kind = OutboxKind::parse_kind(&row.kind)
            .ok_or_else(|| anyhow!("unknown outbox kind {} on {}", row.kind, id))?;
        let payload: OutboxPayload = serde_json::from_str(&row.payload)
            .with_context(|| format!("corrupt payload on outbox record {}", id))?;
        if payload.kind() != kind {
            return Err(anyhow!(
                "outbox record {} stored as {} but payload is {}",
                id,
                kind,
                payload.kind()
            ));
        }
        let sync_state = SyncState::parse_state(&row.sync_state)
            .ok_or_else(|| anyhow!("unknown sync_state {} on {}", row.sync_state, id))?;
        Ok(OutboxRecord {
            id,
            kind,
            payload,
            created_at: from_micros(row.created_at)?,
            sync_state,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(u32::MAX),
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at.map(from_micros).transpose()?,
            syncing_since: row.syncing_since.map(from_micros).transpose()?,
        })
    }
}

pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp out of range: {}", micros))
}

pub fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid uuid {}", raw))
}
