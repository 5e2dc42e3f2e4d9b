use super::model::{to_micros, OutboxRow};
use crate::model::{OutboxKind, OutboxRecord, SyncState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

const OUTBOX_COLUMNS: &str = "id, kind, payload, created_at, sync_state, attempt_count, last_error, next_attempt_at, syncing_since";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability; writers queue on the busy timeout instead of failing fast.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
///
/// Handsets are provisioned with a home-relative `DATABASE_URL`
/// (`sqlite://~/.nursing-sync/outbox.db`), which SQLite itself won't expand.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

/// Outbox schema used on the handset.
pub async fn run_client_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations/client").run(pool).await?;
    Ok(())
}

/// Ledger, inventory, scheduling and visit tables used by the sync server.
pub async fn run_server_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations/server").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_outbox(pool: &Pool, record: &OutboxRecord) -> Result<()> {
    let payload = serde_json::to_string(&record.payload)?;
    sqlx::query(
        "INSERT INTO outbox (id, kind, payload, created_at, sync_state, attempt_count) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(record.id.to_string())
    .bind(record.kind.as_str())
    .bind(payload)
    .bind(to_micros(record.created_at))
    .bind(record.sync_state.as_str())
    .bind(i64::from(record.attempt_count))
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_outbox(pool: &Pool, id: Uuid) -> Result<Option<OutboxRecord>> {
    let row: Option<OutboxRow> =
        sqlx::query_as(&format!("SELECT {} FROM outbox WHERE id = ?", OUTBOX_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
    row.map(OutboxRecord::try_from).transpose()
}

/// Records in `state`, ordered by kind and then capture order.
#[instrument(skip_all)]
pub async fn list_outbox_by_state(pool: &Pool, state: SyncState) -> Result<Vec<OutboxRecord>> {
    let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
        "SELECT {} FROM outbox WHERE sync_state = ? ORDER BY kind ASC, created_at ASC, seq ASC",
        OUTBOX_COLUMNS
    ))
    .bind(state.as_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(OutboxRecord::try_from).collect()
}

#[instrument(skip_all)]
pub async fn count_outbox_by_state(pool: &Pool, state: SyncState) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE sync_state = ?")
        .bind(state.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Claim pending records for an in-flight batch. Returns the ids this call
/// moved; rows another pass already claimed are left out.
#[instrument(skip_all)]
pub async fn mark_outbox_syncing(pool: &Pool, ids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<Uuid>> {
    let mut tx = pool.begin().await?;
    let mut claimed = Vec::with_capacity(ids.len());
    for id in ids {
        let moved: Option<String> = sqlx::query_scalar(
            "UPDATE outbox SET sync_state = 'syncing', syncing_since = ? WHERE id = ? AND sync_state = 'pending' RETURNING id",
        )
        .bind(to_micros(now))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        if moved.is_some() {
            claimed.push(*id);
        }
    }
    tx.commit().await?;
    Ok(claimed)
}

/// Records of `kind` the server has not settled yet (pending or in flight).
#[instrument(skip_all)]
pub async fn list_outbox_unsettled(pool: &Pool, kind: OutboxKind) -> Result<Vec<OutboxRecord>> {
    let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
        "SELECT {} FROM outbox WHERE kind = ? AND sync_state IN ('pending', 'syncing') ORDER BY created_at ASC, seq ASC",
        OUTBOX_COLUMNS
    ))
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(OutboxRecord::try_from).collect()
}

/// Server acknowledged the record. No-op when already synced or unknown.
#[instrument(skip_all)]
pub async fn mark_outbox_synced(pool: &Pool, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE outbox SET sync_state = 'synced', synced_at = ?, syncing_since = NULL, next_attempt_at = NULL WHERE id = ? AND sync_state != 'synced'",
    )
    .bind(to_micros(now))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Terminal failure. Never downgrades a synced record; repeating it only refreshes the reason.
#[instrument(skip_all)]
pub async fn mark_outbox_failed(pool: &Pool, id: Uuid, reason: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE outbox SET sync_state = 'failed', last_error = ?, syncing_since = NULL, next_attempt_at = NULL WHERE id = ? AND sync_state != 'synced'",
    )
    .bind(reason)
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Transient failure: back to pending with one more attempt and a backoff gate.
#[instrument(skip_all)]
pub async fn requeue_outbox(
    pool: &Pool,
    id: Uuid,
    error: &str,
    next_attempt_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE outbox SET sync_state = 'pending', attempt_count = attempt_count + 1, last_error = ?, next_attempt_at = ?, syncing_since = NULL WHERE id = ? AND sync_state IN ('pending', 'syncing')",
    )
    .bind(error)
    .bind(to_micros(next_attempt_at))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Watchdog: records stuck in `syncing` since before `cutoff` go back to pending.
#[instrument(skip_all)]
pub async fn revert_stale_syncing(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE outbox SET sync_state = 'pending', syncing_since = NULL WHERE sync_state = 'syncing' AND (syncing_since IS NULL OR syncing_since <= ?)",
    )
    .bind(to_micros(cutoff))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Operator retry: failed records become pending again with a fresh attempt budget.
#[instrument(skip_all)]
pub async fn retry_failed_outbox(pool: &Pool, ids: Option<&[Uuid]>) -> Result<u64> {
    const RESET: &str = "UPDATE outbox SET sync_state = 'pending', attempt_count = 0, next_attempt_at = NULL WHERE sync_state = 'failed'";
    match ids {
        None => Ok(sqlx::query(RESET).execute(pool).await?.rows_affected()),
        Some(ids) => {
            let mut tx = pool.begin().await?;
            let mut moved = 0;
            for id in ids {
                moved += sqlx::query(&format!("{} AND id = ?", RESET))
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok(moved)
        }
    }
}

#[instrument(skip_all)]
pub async fn purge_synced_outbox(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("DELETE FROM outbox WHERE sync_state = 'synced'")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OutboxKind, OutboxPayload, VisitEventPayload};
    use chrono::Duration as ChronoDuration;
    use chrono::SubsecRound;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_client_migrations(&pool).await.unwrap();
        pool
    }

    fn check_in(created_at: DateTime<Utc>) -> OutboxRecord {
        OutboxRecord {
            id: Uuid::new_v4(),
            kind: OutboxKind::VisitCheckIn,
            payload: OutboxPayload::VisitCheckIn(VisitEventPayload {
                booking_id: Uuid::new_v4(),
                timestamp: created_at,
            }),
            created_at,
            sync_state: SyncState::Pending,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: None,
            syncing_since: None,
        }
    }

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_are_normalized() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("outbox.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let normalized = prepare_sqlite_url(&url);
        assert_eq!(normalized, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn home_relative_handset_url_is_expanded() {
        let home = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", home.path());
        let normalized = prepare_sqlite_url("sqlite://~/.nursing-sync/outbox.db");
        assert_eq!(
            normalized,
            format!("sqlite://{}/.nursing-sync/outbox.db", home.path().display())
        );
        assert!(home.path().join(".nursing-sync").is_dir());
    }

    #[tokio::test]
    async fn state_transitions_round_trip() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let rec = check_in(now);
        insert_outbox(&pool, &rec).await.unwrap();

        let loaded = fetch_outbox(&pool, rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload, rec.payload);
        assert_eq!(loaded.created_at, rec.created_at.trunc_subsecs(6));

        assert_eq!(mark_outbox_syncing(&pool, &[rec.id], now).await.unwrap(), vec![rec.id]);
        // Claiming again does nothing: only pending rows move.
        assert!(mark_outbox_syncing(&pool, &[rec.id], now).await.unwrap().is_empty());
        assert_eq!(list_outbox_unsettled(&pool, rec.kind).await.unwrap().len(), 1);

        assert!(mark_outbox_synced(&pool, rec.id, now).await.unwrap());
        assert!(!mark_outbox_synced(&pool, rec.id, now).await.unwrap());
        assert!(!mark_outbox_failed(&pool, rec.id, "late").await.unwrap());
        let loaded = fetch_outbox(&pool, rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, SyncState::Synced);

        assert_eq!(purge_synced_outbox(&pool).await.unwrap(), 1);
        assert!(fetch_outbox(&pool, rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_syncing_reverts_to_pending() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let old = check_in(now);
        let fresh = check_in(now);
        insert_outbox(&pool, &old).await.unwrap();
        insert_outbox(&pool, &fresh).await.unwrap();
        mark_outbox_syncing(&pool, &[old.id], now - ChronoDuration::seconds(120))
            .await
            .unwrap();
        mark_outbox_syncing(&pool, &[fresh.id], now).await.unwrap();

        let reverted = revert_stale_syncing(&pool, now - ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(reverted, 1);
        let old = fetch_outbox(&pool, old.id).await.unwrap().unwrap();
        assert_eq!(old.sync_state, SyncState::Pending);
        let fresh = fetch_outbox(&pool, fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.sync_state, SyncState::Syncing);
    }

    #[tokio::test]
    async fn requeue_and_retry_failed() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let rec = check_in(now);
        insert_outbox(&pool, &rec).await.unwrap();

        requeue_outbox(&pool, rec.id, "timeout", now + ChronoDuration::seconds(5))
            .await
            .unwrap();
        let loaded = fetch_outbox(&pool, rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempt_count, 1);
        assert!(!loaded.is_due(now));
        assert!(loaded.is_due(now + ChronoDuration::seconds(6)));

        mark_outbox_failed(&pool, rec.id, "rejected").await.unwrap();
        assert_eq!(count_outbox_by_state(&pool, SyncState::Failed).await.unwrap(), 1);

        assert_eq!(retry_failed_outbox(&pool, Some(std::slice::from_ref(&rec.id))).await.unwrap(), 1);
        let loaded = fetch_outbox(&pool, rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, SyncState::Pending);
        assert_eq!(loaded.attempt_count, 0);
        assert_eq!(loaded.last_error.as_deref(), Some("rejected"));
    }
}
