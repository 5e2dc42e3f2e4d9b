//! Idempotency ledger keyed by `(kind, client_id)`.
//!
//! Every mutating path claims its key inside the same transaction as its side
//! effect, and claims it first so the transaction holds the write lock from
//! the start. A rejected record rolls its claim back, which keeps an operator
//! retry possible after the cause (say, low stock) is fixed.

use crate::db::model::to_micros;
use crate::model::OutboxKind;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::instrument;
use uuid::Uuid;

/// Claim the key. Returns false when the record was applied before.
#[instrument(skip_all)]
pub async fn claim(
    conn: &mut SqliteConnection,
    kind: OutboxKind,
    client_id: Uuid,
    device_id: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO sync_ledger (kind, client_id, device_id, applied_at) VALUES (?, ?, ?, ?) ON CONFLICT (kind, client_id) DO NOTHING",
    )
    .bind(kind.as_str())
    .bind(client_id.to_string())
    .bind(device_id)
    .bind(to_micros(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Attach the effect's result so replays can echo it.
#[instrument(skip_all)]
pub async fn record_result(
    conn: &mut SqliteConnection,
    kind: OutboxKind,
    client_id: Uuid,
    result: &Value,
) -> Result<()> {
    sqlx::query("UPDATE sync_ledger SET result = ? WHERE kind = ? AND client_id = ?")
        .bind(result.to_string())
        .bind(kind.as_str())
        .bind(client_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn prior_result(
    conn: &mut SqliteConnection,
    kind: OutboxKind,
    client_id: Uuid,
) -> Result<Option<Value>> {
    let raw: Option<Option<String>> =
        sqlx::query_scalar("SELECT result FROM sync_ledger WHERE kind = ? AND client_id = ?")
            .bind(kind.as_str())
            .bind(client_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    raw.flatten()
        .map(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
        .transpose()
}
