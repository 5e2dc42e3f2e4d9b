use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use nursing_sync::api::{
    ApiError, RecordResult, RejectReason, SyncApi, SyncBatch, SyncBatchResponse,
};
use nursing_sync::config::RetryPolicy;
use nursing_sync::connectivity::ConnectivityMonitor;
use nursing_sync::db;
use nursing_sync::model::{
    InventoryUsagePayload, OutboxKind, OutboxPayload, SyncState, VisitEventPayload, VitalsPayload,
};
use nursing_sync::outbox::{OutboxCounts, OutboxStore};
use nursing_sync::sync::{SyncEngine, SyncOptions};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

type Responder = Box<dyn Fn(&SyncBatch) -> Result<SyncBatchResponse, ApiError> + Send + Sync>;

enum Step {
    Respond(Responder),
    /// Sleep, then apply everything.
    Stall(Duration),
}

/// Fake sync server: plays scripted steps in order, then applies everything.
#[derive(Clone, Default)]
struct RecordingApi {
    steps: Arc<Mutex<VecDeque<Step>>>,
    batches: Arc<Mutex<Vec<SyncBatch>>>,
}

impl RecordingApi {
    async fn push(&self, step: Step) {
        self.steps.lock().await.push_back(step);
    }

    async fn respond<F>(&self, f: F)
    where
        F: Fn(&SyncBatch) -> Result<SyncBatchResponse, ApiError> + Send + Sync + 'static,
    {
        self.push(Step::Respond(Box::new(f))).await;
    }

    async fn batches(&self) -> Vec<SyncBatch> {
        self.batches.lock().await.clone()
    }
}

fn apply_all(batch: &SyncBatch) -> SyncBatchResponse {
    SyncBatchResponse {
        results: batch
            .records
            .iter()
            .map(|r| RecordResult::applied(r.client_id))
            .collect(),
    }
}

#[async_trait]
impl SyncApi for RecordingApi {
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<SyncBatchResponse, ApiError> {
        self.batches.lock().await.push(batch.clone());
        let step = self.steps.lock().await.pop_front();
        match step {
            Some(Step::Respond(f)) => f(batch),
            Some(Step::Stall(d)) => {
                tokio::time::sleep(d).await;
                Ok(apply_all(batch))
            }
            None => Ok(apply_all(batch)),
        }
    }
}

async fn setup_store() -> OutboxStore {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    db::run_client_migrations(&pool).await.unwrap();
    OutboxStore::open(pool).await.unwrap()
}

fn options() -> SyncOptions {
    SyncOptions {
        device_id: "tablet-7".into(),
        batch_timeout: Duration::from_secs(2),
        max_batch_size: 50,
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        },
        poll_interval: Duration::from_millis(20),
    }
}

fn engine(store: &OutboxStore, api: &RecordingApi, opts: SyncOptions) -> SyncEngine {
    SyncEngine::new(store.clone(), Arc::new(api.clone()), opts)
}

fn usage(qty: i64) -> OutboxPayload {
    OutboxPayload::InventoryUsage(InventoryUsagePayload {
        inventory_item_id: Uuid::from_u128(7),
        quantity_used: qty,
        booking_id: None,
    })
}

fn vital() -> OutboxPayload {
    OutboxPayload::Vital(VitalsPayload {
        booking_id: Uuid::new_v4(),
        recorded_at: Utc::now(),
        heart_rate: Some(70),
        systolic: None,
        diastolic: None,
        temperature_c: None,
        respiratory_rate: None,
        oxygen_saturation: None,
        blood_glucose: None,
        notes: None,
    })
}

#[tokio::test]
async fn records_go_out_in_capture_order_one_kind_per_batch() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(
        &store,
        &api,
        SyncOptions {
            max_batch_size: 2,
            ..options()
        },
    );

    let t0 = Utc::now() - ChronoDuration::minutes(10);
    let third = store.enqueue_at(usage(3), t0 + ChronoDuration::seconds(30)).await.unwrap();
    let first = store.enqueue_at(usage(1), t0).await.unwrap();
    let v = store.enqueue(vital()).await.unwrap();
    let second = store.enqueue_at(usage(2), t0 + ChronoDuration::seconds(10)).await.unwrap();
    let check_in = store
        .enqueue(OutboxPayload::VisitCheckIn(VisitEventPayload {
            booking_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }))
        .await
        .unwrap();

    let report = engine.sync_pending_data().await.unwrap();
    assert_eq!(report.synced, 5);
    assert_eq!(report.batches, 4);
    assert_eq!(store.counts(), OutboxCounts { pending: 0, failed: 0 });

    let batches = api.batches().await;
    for batch in &batches {
        assert_eq!(batch.device_id, "tablet-7");
        assert!(batch.records.iter().all(|r| r.payload.kind() == batch.kind));
    }
    let usage_order: Vec<Uuid> = batches
        .iter()
        .filter(|b| b.kind == OutboxKind::InventoryUsage)
        .flat_map(|b| b.records.iter().map(|r| r.client_id))
        .collect();
    assert_eq!(usage_order, vec![first.id, second.id, third.id]);
    let others: Vec<Uuid> = batches
        .iter()
        .filter(|b| b.kind != OutboxKind::InventoryUsage)
        .flat_map(|b| b.records.iter().map(|r| r.client_id))
        .collect();
    assert!(others.contains(&v.id) && others.contains(&check_in.id));

    // Acknowledged rows are purged; nothing is left to resend.
    assert!(store.get(first.id).await.unwrap().is_none());
    let again = engine.sync_pending_data().await.unwrap();
    assert_eq!(again.batches, 0);
}

#[tokio::test]
async fn rejected_record_fails_while_its_neighbours_sync() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(&store, &api, options());

    let ok = store.enqueue(usage(1)).await.unwrap();
    let short = store.enqueue(usage(5)).await.unwrap();
    let replayed = store.enqueue(usage(2)).await.unwrap();

    let short_id = short.id;
    let replayed_id = replayed.id;
    api.respond(move |batch| {
        Ok(SyncBatchResponse {
            results: batch
                .records
                .iter()
                .map(|r| match r.client_id {
                    id if id == short_id => RecordResult::rejected(
                        id,
                        RejectReason::InsufficientStock { available: 3, requested: 5 },
                    ),
                    id if id == replayed_id => RecordResult::duplicate(id),
                    id => RecordResult::applied(id),
                })
                .collect(),
        })
    })
    .await;

    let report = engine.sync_pending_data().await.unwrap();
    assert_eq!((report.synced, report.duplicates, report.failed), (1, 1, 1));
    assert_eq!(store.counts(), OutboxCounts { pending: 0, failed: 1 });

    let failed = store.get(short.id).await.unwrap().unwrap();
    assert_eq!(failed.sync_state, SyncState::Failed);
    assert!(failed.last_error.unwrap().contains("insufficient stock"));
    assert!(store.get(ok.id).await.unwrap().is_none());

    // Failed records stay out of automatic drains.
    let again = engine.sync_pending_data().await.unwrap();
    assert_eq!(again.batches, 0);
    assert_eq!(store.list_failed().await.unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failures_retry_then_give_up_at_the_cap() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(&store, &api, options());
    let rec = store.enqueue(usage(1)).await.unwrap();

    for _ in 0..3 {
        api.respond(|_| Err(ApiError::Transient("503 Service Unavailable".into()))).await;
    }

    let first = engine.sync_pending_data().await.unwrap();
    assert_eq!(first.requeued, 1);
    let after_first = store.get(rec.id).await.unwrap().unwrap();
    assert_eq!(after_first.sync_state, SyncState::Pending);
    assert_eq!(after_first.attempt_count, 1);

    engine.sync_pending_data().await.unwrap();
    let third = engine.sync_pending_data().await.unwrap();
    assert_eq!(third.failed, 1);

    let gave_up = store.get(rec.id).await.unwrap().unwrap();
    assert_eq!(gave_up.sync_state, SyncState::Failed);
    assert!(gave_up.last_error.unwrap().starts_with("gave up after 3 attempts"));
    assert_eq!(store.counts(), OutboxCounts { pending: 0, failed: 1 });
    assert_eq!(api.batches().await.len(), 3);
}

#[tokio::test]
async fn backoff_holds_back_later_records_of_the_same_kind_only() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(
        &store,
        &api,
        SyncOptions {
            max_batch_size: 1,
            retry: RetryPolicy {
                max_attempts: 5,
                base_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(600),
            },
            ..options()
        },
    );

    let t0 = Utc::now() - ChronoDuration::minutes(5);
    let a = store.enqueue_at(usage(1), t0).await.unwrap();
    let b = store.enqueue_at(usage(1), t0 + ChronoDuration::seconds(1)).await.unwrap();
    store.enqueue(vital()).await.unwrap();

    // Kinds drain vital first, then inventory usage.
    api.respond(|batch| Ok(apply_all(batch))).await;
    api.respond(|_| Err(ApiError::Transient("connection reset".into()))).await;

    let report = engine.sync_pending_data().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.deferred, 1);

    let a_now = store.get(a.id).await.unwrap().unwrap();
    assert!(a_now.next_attempt_at.unwrap() > Utc::now() + ChronoDuration::seconds(30));
    assert_eq!(store.get(b.id).await.unwrap().unwrap().attempt_count, 0);

    // `a` is still backing off, so `b` must not overtake it.
    let second = engine.sync_pending_data().await.unwrap();
    assert_eq!(second.batches, 0);
    assert_eq!(second.deferred, 2);
    assert_eq!(api.batches().await.len(), 2);
}

#[tokio::test]
async fn refused_batch_fails_every_record_in_it() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(&store, &api, options());
    store.enqueue(usage(1)).await.unwrap();
    store.enqueue(usage(2)).await.unwrap();

    api.respond(|_| {
        Err(ApiError::Rejected {
            status: 400,
            body: "malformed batch".into(),
        })
    })
    .await;

    let report = engine.sync_pending_data().await.unwrap();
    assert_eq!(report.failed, 2);
    let failed = store.list_failed().await.unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|r| r.last_error.as_deref().unwrap().contains("400")));
}

#[tokio::test]
async fn missing_result_is_retried_not_dropped() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(&store, &api, options());
    let answered = store.enqueue(usage(1)).await.unwrap();
    let forgotten = store.enqueue(usage(1)).await.unwrap();

    let answered_id = answered.id;
    api.respond(move |_| {
        Ok(SyncBatchResponse {
            results: vec![RecordResult::applied(answered_id)],
        })
    })
    .await;

    let report = engine.sync_pending_data().await.unwrap();
    assert_eq!((report.synced, report.requeued), (1, 1));
    let rec = store.get(forgotten.id).await.unwrap().unwrap();
    assert_eq!(rec.sync_state, SyncState::Pending);
    assert_eq!(rec.attempt_count, 1);

    engine.sync_pending_data().await.unwrap();
    assert_eq!(store.counts().pending, 0);
}

#[tokio::test]
async fn timed_out_batch_goes_back_to_pending() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(
        &store,
        &api,
        SyncOptions {
            batch_timeout: Duration::from_millis(100),
            ..options()
        },
    );
    let rec = store.enqueue(usage(1)).await.unwrap();
    api.push(Step::Stall(Duration::from_secs(5))).await;

    let report = engine.sync_pending_data().await.unwrap();
    assert_eq!(report.requeued, 1);
    let after = store.get(rec.id).await.unwrap().unwrap();
    assert_eq!(after.sync_state, SyncState::Pending);
    assert!(after.last_error.unwrap().contains("timed out"));

    engine.sync_pending_data().await.unwrap();
    assert_eq!(store.counts().pending, 0);
}

#[tokio::test]
async fn watchdog_reverts_records_stuck_in_flight() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(
        &store,
        &api,
        SyncOptions {
            batch_timeout: Duration::from_millis(50),
            ..options()
        },
    );
    let rec = store.enqueue(usage(1)).await.unwrap();

    // Simulates a process killed mid-request.
    store.mark_syncing(&[rec.id]).await.unwrap();
    assert_eq!(engine.watchdog().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.watchdog().await.unwrap(), 1);
    assert_eq!(
        store.get(rec.id).await.unwrap().unwrap().sync_state,
        SyncState::Pending
    );

    engine.sync_pending_data().await.unwrap();
    assert_eq!(api.batches().await.len(), 1);
    assert_eq!(store.counts().pending, 0);
}

/// Another process sharing the outbox claims `steal` while this engine's
/// first batch is on the wire.
struct RacingDrain {
    inner: RecordingApi,
    store: OutboxStore,
    steal: Uuid,
}

#[async_trait]
impl SyncApi for RacingDrain {
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<SyncBatchResponse, ApiError> {
        if batch.kind == OutboxKind::Vital {
            self.store.mark_syncing(&[self.steal]).await.unwrap();
        }
        self.inner.submit_batch(batch).await
    }
}

#[tokio::test]
async fn records_claimed_by_another_drain_are_not_sent() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let t0 = Utc::now() - ChronoDuration::minutes(5);
    store.enqueue_at(vital(), t0).await.unwrap();
    let taken = store.enqueue_at(usage(1), t0).await.unwrap();
    let mine = store.enqueue_at(usage(2), t0 + ChronoDuration::seconds(1)).await.unwrap();

    let racing = RacingDrain {
        inner: api.clone(),
        store: store.clone(),
        steal: taken.id,
    };
    let engine = SyncEngine::new(store.clone(), Arc::new(racing), options());

    let report = engine.sync_pending_data().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.synced, 2);

    let batches = api.batches().await;
    assert_eq!(batches.len(), 2);
    let usage_ids: Vec<Uuid> = batches[1].records.iter().map(|r| r.client_id).collect();
    assert_eq!(usage_ids, vec![mine.id]);

    // Still owned by the other drain: untouched here.
    let held = store.get(taken.id).await.unwrap().unwrap();
    assert_eq!(held.sync_state, SyncState::Syncing);
    assert_eq!(held.attempt_count, 0);
    assert_eq!(store.counts().pending, 1);
}

#[tokio::test]
async fn concurrent_trigger_is_coalesced() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(&store, &api, options());
    store.enqueue(usage(1)).await.unwrap();
    api.push(Step::Stall(Duration::from_millis(100))).await;

    let mut syncing = engine.subscribe_syncing();
    let (a, b) = tokio::join!(engine.sync_pending_data(), engine.sync_pending_data());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.coalesced != b.coalesced);
    assert_eq!(a.synced + b.synced, 1);
    assert_eq!(api.batches().await.len(), 1);
    assert!(!engine.is_syncing());
    assert!(syncing.has_changed().unwrap());
    assert!(!*syncing.borrow_and_update());
}

#[tokio::test]
async fn run_drains_when_connectivity_returns() {
    let store = setup_store().await;
    let api = RecordingApi::default();
    let engine = engine(&store, &api, options());
    let monitor = ConnectivityMonitor::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    store.enqueue(usage(1)).await.unwrap();
    store.enqueue(vital()).await.unwrap();

    let runner = engine.clone();
    let connectivity = monitor.subscribe();
    let handle = tokio::spawn(async move { runner.run(connectivity, stop_rx).await });

    // Offline: nothing leaves the device.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(api.batches().await.is_empty());

    let mut counts = store.subscribe();
    monitor.observe(true);
    tokio::time::timeout(Duration::from_secs(2), async {
        while counts.borrow_and_update().pending > 0 {
            counts.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert_eq!(api.batches().await.len(), 2);

    stop_tx.send(true).unwrap();
    handle.await.unwrap();
}
