//! Periodic GPS sampling for the practitioner using this handset.
//!
//! Every successful fix replaces `current_location` and is pushed to the
//! server, which keeps only the latest position per practitioner. A failed
//! read is reported and the previous fix stays current.

use crate::api::LocationUpdate;
use crate::geo;
use crate::model::GeoFix;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("location permission denied")]
    PermissionDenied,
    #[error("invalid fix: {0}")]
    Invalid(String),
}

/// Platform geolocation capability.
#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn current_position(&self) -> Result<GeoFix, GeoError>;
}

/// Where fresh fixes are published (the sync server in production).
#[async_trait]
pub trait LocationSink: Send + Sync {
    async fn publish(&self, practitioner_id: Uuid, update: &LocationUpdate) -> Result<()>;
}

/// Reads the most recent fix the platform layer wrote as JSON.
#[derive(Debug, Clone)]
pub struct FileGeolocator {
    path: PathBuf,
}

impl FileGeolocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Geolocator for FileGeolocator {
    async fn current_position(&self) -> Result<GeoFix, GeoError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => GeoError::PermissionDenied,
            _ => GeoError::Unavailable(format!("{}: {}", self.path.display(), e)),
        })?;
        serde_json::from_str(&raw).map_err(|e| GeoError::Invalid(e.to_string()))
    }
}

#[derive(Clone)]
pub struct LocationTracker {
    practitioner_id: Uuid,
    geo: Arc<dyn Geolocator>,
    sink: Arc<dyn LocationSink>,
    current: Arc<watch::Sender<Option<GeoFix>>>,
    tracking: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LocationTracker {
    pub fn new(practitioner_id: Uuid, geo: Arc<dyn Geolocator>, sink: Arc<dyn LocationSink>) -> Self {
        let (current, _) = watch::channel(None);
        let (tracking, _) = watch::channel(false);
        Self {
            practitioner_id,
            geo,
            sink,
            current: Arc::new(current),
            tracking: Arc::new(tracking),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current_location(&self) -> Option<GeoFix> {
        *self.current.borrow()
    }

    pub fn subscribe_location(&self) -> watch::Receiver<Option<GeoFix>> {
        self.current.subscribe()
    }

    pub fn is_tracking(&self) -> bool {
        *self.tracking.borrow()
    }

    pub fn subscribe_tracking(&self) -> watch::Receiver<bool> {
        self.tracking.subscribe()
    }

    /// One-shot sample, e.g. when periodic tracking is off to save power.
    pub async fn manual_update(&self) -> Result<GeoFix, GeoError> {
        self.sample().await
    }

    #[instrument(skip_all, fields(practitioner_id = %self.practitioner_id))]
    async fn sample(&self) -> Result<GeoFix, GeoError> {
        let fix = self.geo.current_position().await?;
        if !geo::is_valid_coordinate(fix.latitude, fix.longitude) {
            return Err(GeoError::Invalid(format!(
                "coordinates out of range: {}, {}",
                fix.latitude, fix.longitude
            )));
        }

        let accepted = self.current.send_if_modified(|current| match current {
            Some(prev) if prev.timestamp > fix.timestamp => false,
            _ => {
                *current = Some(fix);
                true
            }
        });
        if !accepted {
            debug!("ignoring fix older than the current one");
            return Ok(fix);
        }

        if let Err(err) = self.sink.publish(self.practitioner_id, &fix.into()).await {
            warn!(?err, "location publish failed; fix kept locally");
        }
        Ok(fix)
    }

    /// Start periodic sampling. Returns false when tracking is already running
    /// or the interval is zero.
    pub fn start_tracking(&self, update_interval: Duration) -> bool {
        if update_interval.is_zero() {
            warn!("refusing to track with a zero update interval");
            return false;
        }
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let tracker = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(update_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = tracker.sample().await {
                    warn!(?err, "GPS read failed; keeping previous location");
                }
            }
        }));
        self.tracking.send_replace(true);
        info!(interval_ms = update_interval.as_millis() as u64, "location tracking started");
        true
    }

    pub fn stop_tracking(&self) {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = task.take() {
            handle.abort();
            info!("location tracking stopped");
        }
        self.tracking.send_replace(false);
    }
}
