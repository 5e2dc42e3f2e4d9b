//! Latest known position per practitioner.

use crate::api::LocationUpdate;
use crate::db::model::{from_micros, parse_uuid, to_micros};
use crate::db::Pool;
use crate::geo;
use crate::model::PractitionerLocation;
use anyhow::Result;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationWrite {
    Stored,
    /// Older than the stored sample; ignored.
    Stale,
    UnknownPractitioner,
    InvalidCoordinates,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LocationRow {
    pub practitioner_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub recorded_at: i64,
}

impl TryFrom<LocationRow> for PractitionerLocation {
    type Error = anyhow::Error;

    fn try_from(row: LocationRow) -> Result<Self> {
        Ok(PractitionerLocation {
            practitioner_id: parse_uuid(&row.practitioner_id)?,
            latitude: row.latitude,
            longitude: row.longitude,
            accuracy: row.accuracy,
            recorded_at: from_micros(row.recorded_at)?,
        })
    }
}

/// Overwrite the practitioner's position unless the stored one is newer.
#[instrument(skip_all, fields(practitioner_id = %practitioner_id))]
pub async fn upsert_location(pool: &Pool, practitioner_id: Uuid, update: &LocationUpdate) -> Result<LocationWrite> {
    if !geo::is_valid_coordinate(update.latitude, update.longitude) {
        return Ok(LocationWrite::InvalidCoordinates);
    }
    let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM practitioners WHERE id = ?")
        .bind(practitioner_id.to_string())
        .fetch_optional(pool)
        .await?;
    if known.is_none() {
        return Ok(LocationWrite::UnknownPractitioner);
    }

    let res = sqlx::query(
        "INSERT INTO practitioner_locations (practitioner_id, latitude, longitude, accuracy, recorded_at) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (practitioner_id) DO UPDATE SET latitude = excluded.latitude, longitude = excluded.longitude, \
         accuracy = excluded.accuracy, recorded_at = excluded.recorded_at \
         WHERE excluded.recorded_at >= practitioner_locations.recorded_at",
    )
    .bind(practitioner_id.to_string())
    .bind(update.latitude)
    .bind(update.longitude)
    .bind(update.accuracy)
    .bind(to_micros(update.recorded_at))
    .execute(pool)
    .await?;

    if res.rows_affected() == 0 {
        debug!("stale location sample ignored");
        return Ok(LocationWrite::Stale);
    }
    Ok(LocationWrite::Stored)
}

pub async fn latest_location(pool: &Pool, practitioner_id: Uuid) -> Result<Option<PractitionerLocation>> {
    let row: Option<LocationRow> = sqlx::query_as(
        "SELECT practitioner_id, latitude, longitude, accuracy, recorded_at FROM practitioner_locations WHERE practitioner_id = ?",
    )
    .bind(practitioner_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(PractitionerLocation::try_from).transpose()
}
