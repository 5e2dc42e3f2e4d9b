//! Visit check-in/out and vitals, applied inside the ingest transaction.

use crate::api::RejectReason;
use crate::db::model::to_micros;
use crate::model::VitalsPayload;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Outcome of one effect applied on a transaction. A rejection must be
/// rolled back by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Applied,
    Rejected(RejectReason),
}

fn visit_state(message: impl Into<String>) -> Effect {
    Effect::Rejected(RejectReason::VisitState {
        message: message.into(),
    })
}

#[instrument(skip_all, fields(booking_id = %booking_id))]
pub async fn check_in(conn: &mut SqliteConnection, booking_id: Uuid, at: DateTime<Utc>) -> Result<Effect> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM appointments WHERE id = ?")
        .bind(booking_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(status) = status.as_deref() {
        if status == "cancelled" || status == "completed" {
            return Ok(visit_state(format!("appointment is {}", status)));
        }
    }

    let res = sqlx::query(
        "INSERT INTO visits (booking_id, check_in_time) VALUES (?, ?) \
         ON CONFLICT (booking_id) DO UPDATE SET check_in_time = excluded.check_in_time \
         WHERE visits.check_in_time IS NULL",
    )
    .bind(booking_id.to_string())
    .bind(to_micros(at))
    .execute(&mut *conn)
    .await?;
    if res.rows_affected() == 0 {
        return Ok(visit_state("visit already checked in"));
    }

    sqlx::query("UPDATE appointments SET status = 'in_progress' WHERE id = ? AND status = 'confirmed'")
        .bind(booking_id.to_string())
        .execute(&mut *conn)
        .await?;
    debug!("checked in");
    Ok(Effect::Applied)
}

#[instrument(skip_all, fields(booking_id = %booking_id))]
pub async fn check_out(conn: &mut SqliteConnection, booking_id: Uuid, at: DateTime<Utc>) -> Result<Effect> {
    let at = to_micros(at);
    let res = sqlx::query(
        "UPDATE visits SET check_out_time = ? \
         WHERE booking_id = ? AND check_in_time IS NOT NULL AND check_out_time IS NULL AND check_in_time < ?",
    )
    .bind(at)
    .bind(booking_id.to_string())
    .bind(at)
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() == 0 {
        let row: Option<(Option<i64>, Option<i64>)> =
            sqlx::query_as("SELECT check_in_time, check_out_time FROM visits WHERE booking_id = ?")
                .bind(booking_id.to_string())
                .fetch_optional(&mut *conn)
                .await?;
        return Ok(match row {
            None | Some((None, _)) => visit_state("no check-in recorded for this visit"),
            Some((_, Some(_))) => visit_state("visit already checked out"),
            Some((Some(_), None)) => visit_state("check-out must be after check-in"),
        });
    }

    sqlx::query("UPDATE appointments SET status = 'completed' WHERE id = ? AND status = 'in_progress'")
        .bind(booking_id.to_string())
        .execute(&mut *conn)
        .await?;
    debug!("checked out");
    Ok(Effect::Applied)
}

/// Physiological plausibility bounds; readings outside them are data-entry errors.
pub fn validate_vitals(v: &VitalsPayload) -> std::result::Result<(), String> {
    fn check<T: PartialOrd + Copy + std::fmt::Display>(
        name: &str,
        value: Option<T>,
        min: T,
        max: T,
    ) -> std::result::Result<(), String> {
        match value {
            Some(x) if x < min || x > max => Err(format!("{} {} outside {}..={}", name, x, min, max)),
            _ => Ok(()),
        }
    }

    let any = v.heart_rate.is_some()
        || v.systolic.is_some()
        || v.diastolic.is_some()
        || v.temperature_c.is_some()
        || v.respiratory_rate.is_some()
        || v.oxygen_saturation.is_some()
        || v.blood_glucose.is_some();
    if !any {
        return Err("no measurements recorded".to_string());
    }

    check("heart_rate", v.heart_rate, 20, 300)?;
    check("systolic", v.systolic, 40, 300)?;
    check("diastolic", v.diastolic, 20, 200)?;
    check("temperature_c", v.temperature_c, 25.0, 45.0)?;
    check("respiratory_rate", v.respiratory_rate, 4, 80)?;
    check("oxygen_saturation", v.oxygen_saturation, 50, 100)?;
    check("blood_glucose", v.blood_glucose, 0.5, 60.0)?;
    if let (Some(sys), Some(dia)) = (v.systolic, v.diastolic) {
        if dia >= sys {
            return Err(format!("diastolic {} not below systolic {}", dia, sys));
        }
    }
    Ok(())
}

#[instrument(skip_all, fields(client_id = %client_id))]
pub async fn record_vitals(conn: &mut SqliteConnection, client_id: Uuid, v: &VitalsPayload) -> Result<Effect> {
    if let Err(message) = validate_vitals(v) {
        return Ok(Effect::Rejected(RejectReason::InvalidPayload { message }));
    }
    sqlx::query(
        "INSERT INTO vitals (client_id, booking_id, recorded_at, heart_rate, systolic, diastolic, temperature_c, respiratory_rate, oxygen_saturation, blood_glucose, notes) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(client_id.to_string())
    .bind(v.booking_id.to_string())
    .bind(to_micros(v.recorded_at))
    .bind(v.heart_rate.map(i64::from))
    .bind(v.systolic.map(i64::from))
    .bind(v.diastolic.map(i64::from))
    .bind(v.temperature_c)
    .bind(v.respiratory_rate.map(i64::from))
    .bind(v.oxygen_saturation.map(i64::from))
    .bind(v.blood_glucose)
    .bind(v.notes.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(Effect::Applied)
}
