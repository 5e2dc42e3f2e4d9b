//! Server-side stock counts.
//!
//! `quantity` only ever changes through [`decrement`], a single conditional
//! `UPDATE` that cannot take a count below zero no matter how many devices
//! replay usage at once.

use crate::db::model::{parse_uuid, to_micros};
use crate::db::Pool;
use crate::model::{InventoryItem, OutboxKind};
use crate::server::ledger;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UsageOutcome {
    Applied { quantity: i64 },
    /// Already applied under this client id; `quantity` is what it left behind.
    Duplicate { quantity: i64 },
    InsufficientStock { available: i64, requested: i64 },
    UnknownItem,
    InvalidQuantity { requested: i64 },
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ItemRow {
    id: String,
    name: String,
    category: String,
    quantity: i64,
    reorder_level: i64,
}

impl TryFrom<ItemRow> for InventoryItem {
    type Error = anyhow::Error;

    fn try_from(row: ItemRow) -> Result<Self> {
        Ok(InventoryItem {
            id: parse_uuid(&row.id)?,
            name: row.name,
            category: row.category,
            quantity: row.quantity,
            reorder_level: row.reorder_level,
        })
    }
}

/// Decrement stock for one usage record on a connection whose transaction
/// already holds the ledger claim. Anything but `Applied` must be rolled back
/// by the caller.
#[instrument(skip_all)]
pub async fn decrement(
    conn: &mut SqliteConnection,
    inventory_item_id: Uuid,
    quantity_used: i64,
    client_id: Uuid,
    booking_id: Option<Uuid>,
) -> Result<UsageOutcome> {
    if quantity_used <= 0 {
        return Ok(UsageOutcome::InvalidQuantity {
            requested: quantity_used,
        });
    }

    let remaining: Option<i64> = sqlx::query_scalar(
        "UPDATE inventory_items SET quantity = quantity - ? WHERE id = ? AND quantity >= ? RETURNING quantity",
    )
    .bind(quantity_used)
    .bind(inventory_item_id.to_string())
    .bind(quantity_used)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(quantity) = remaining else {
        let available: Option<i64> =
            sqlx::query_scalar("SELECT quantity FROM inventory_items WHERE id = ?")
                .bind(inventory_item_id.to_string())
                .fetch_optional(&mut *conn)
                .await?;
        return Ok(match available {
            Some(available) => UsageOutcome::InsufficientStock {
                available,
                requested: quantity_used,
            },
            None => UsageOutcome::UnknownItem,
        });
    };

    sqlx::query(
        "INSERT INTO inventory_usage (client_id, inventory_item_id, quantity_used, resulting_quantity, booking_id, applied_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(client_id.to_string())
    .bind(inventory_item_id.to_string())
    .bind(quantity_used)
    .bind(quantity)
    .bind(booking_id.map(|b| b.to_string()))
    .bind(to_micros(Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(UsageOutcome::Applied { quantity })
}

#[derive(Clone)]
pub struct InventoryService {
    pool: Pool,
}

impl InventoryService {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(name = %name))]
    pub async fn create_item(
        &self,
        name: &str,
        category: &str,
        quantity: i64,
        reorder_level: i64,
    ) -> Result<InventoryItem> {
        anyhow::ensure!(quantity >= 0, "initial quantity must not be negative");
        let item = InventoryItem {
            id: Uuid::new_v4(),
            name: name.to_string(),
            category: category.to_string(),
            quantity,
            reorder_level,
        };
        sqlx::query(
            "INSERT INTO inventory_items (id, name, category, quantity, reorder_level) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(item.id.to_string())
        .bind(&item.name)
        .bind(&item.category)
        .bind(item.quantity)
        .bind(item.reorder_level)
        .execute(&self.pool)
        .await?;
        Ok(item)
    }

    pub async fn get_item(&self, id: Uuid) -> Result<Option<InventoryItem>> {
        let row: Option<ItemRow> = sqlx::query_as(
            "SELECT id, name, category, quantity, reorder_level FROM inventory_items WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(InventoryItem::try_from).transpose()
    }

    /// Items at or below their reorder level, emptiest first.
    pub async fn low_stock(&self) -> Result<Vec<InventoryItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(
            "SELECT id, name, category, quantity, reorder_level FROM inventory_items WHERE quantity <= reorder_level ORDER BY quantity ASC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(InventoryItem::try_from).collect()
    }

    /// Apply one usage record exactly once.
    #[instrument(skip_all, fields(item = %inventory_item_id, client_id = %client_id))]
    pub async fn apply_usage(
        &self,
        inventory_item_id: Uuid,
        quantity_used: i64,
        client_id: Uuid,
    ) -> Result<UsageOutcome> {
        let mut tx = self.pool.begin().await?;
        if !ledger::claim(&mut tx, OutboxKind::InventoryUsage, client_id, None).await? {
            tx.rollback().await?;
            let mut conn = self.pool.acquire().await?;
            let quantity = prior_quantity(&mut conn, client_id).await?;
            return Ok(UsageOutcome::Duplicate { quantity });
        }

        let outcome = decrement(&mut tx, inventory_item_id, quantity_used, client_id, None).await?;
        match outcome {
            UsageOutcome::Applied { quantity } => {
                ledger::record_result(
                    &mut tx,
                    OutboxKind::InventoryUsage,
                    client_id,
                    &json!({ "quantity": quantity }),
                )
                .await?;
                tx.commit().await?;
                info!(quantity, "usage applied");
            }
            other => {
                tx.rollback().await?;
                warn!(outcome = ?other, "usage not applied");
            }
        }
        Ok(outcome)
    }
}

/// Stock level left behind by an already-applied usage record.
pub async fn prior_quantity(conn: &mut SqliteConnection, client_id: Uuid) -> Result<i64> {
    let recorded: Option<i64> =
        sqlx::query_scalar("SELECT resulting_quantity FROM inventory_usage WHERE client_id = ?")
            .bind(client_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(quantity) = recorded {
        return Ok(quantity);
    }
    let replay = ledger::prior_result(conn, OutboxKind::InventoryUsage, client_id).await?;
    replay
        .and_then(|v| v.get("quantity").and_then(|q| q.as_i64()))
        .ok_or_else(|| anyhow::anyhow!("ledger entry {} has no recorded quantity", client_id))
}
