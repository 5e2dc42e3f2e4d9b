//! Practitioner and appointment records.
//!
//! Appointments are created unassigned; `practitioner_id` is written only by
//! the assignment resolver.

use crate::db::model::parse_uuid;
use crate::db::Pool;
use crate::model::{minute_of_day, Appointment, AppointmentStatus, Practitioner, WeekdaySet};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

pub(crate) fn time_from_minute(minute: i64) -> Result<NaiveTime> {
    let m = u32::try_from(minute).map_err(|_| anyhow!("negative minute of day {}", minute))?;
    NaiveTime::from_hms_opt(m / 60, m % 60, 0).ok_or_else(|| anyhow!("minute of day out of range: {}", minute))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PractitionerRow {
    pub id: String,
    pub name: String,
    pub is_available: i64,
    pub available_days: i64,
    pub work_start_minute: i64,
    pub work_end_minute: i64,
    pub service_radius_km: f64,
}

impl TryFrom<PractitionerRow> for Practitioner {
    type Error = anyhow::Error;

    fn try_from(row: PractitionerRow) -> Result<Self> {
        Ok(Practitioner {
            id: parse_uuid(&row.id)?,
            name: row.name,
            is_available: row.is_available != 0,
            available_days: WeekdaySet::from_bits(u8::try_from(row.available_days).unwrap_or(0)),
            work_start_time: time_from_minute(row.work_start_minute)?,
            work_end_time: time_from_minute(row.work_end_minute)?,
            service_radius_km: row.service_radius_km,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AppointmentRow {
    id: String,
    practitioner_id: Option<String>,
    appointment_date: String,
    start_minute: i64,
    duration_minutes: i64,
    location_latitude: f64,
    location_longitude: f64,
    status: String,
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = anyhow::Error;

    fn try_from(row: AppointmentRow) -> Result<Self> {
        Ok(Appointment {
            id: parse_uuid(&row.id)?,
            practitioner_id: row.practitioner_id.as_deref().map(parse_uuid).transpose()?,
            appointment_date: NaiveDate::parse_from_str(&row.appointment_date, DATE_FORMAT)
                .with_context(|| format!("bad appointment_date {}", row.appointment_date))?,
            appointment_time: time_from_minute(row.start_minute)?,
            duration_minutes: u32::try_from(row.duration_minutes)
                .with_context(|| format!("bad duration {}", row.duration_minutes))?,
            location_latitude: row.location_latitude,
            location_longitude: row.location_longitude,
            status: AppointmentStatus::parse_status(&row.status)
                .ok_or_else(|| anyhow!("unknown appointment status {}", row.status))?,
        })
    }
}

/// A booking request as it arrives from the booking flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAppointment {
    pub appointment_date: NaiveDate,
    pub appointment_time: NaiveTime,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    pub location_latitude: f64,
    pub location_longitude: f64,
}

#[instrument(skip_all, fields(id = %p.id))]
pub async fn create_practitioner(pool: &Pool, p: &Practitioner) -> Result<()> {
    sqlx::query(
        "INSERT INTO practitioners (id, name, is_available, available_days, work_start_minute, work_end_minute, service_radius_km) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(p.id.to_string())
    .bind(&p.name)
    .bind(p.is_available)
    .bind(i64::from(p.available_days.bits()))
    .bind(i64::from(minute_of_day(p.work_start_time)))
    .bind(i64::from(minute_of_day(p.work_end_time)))
    .bind(p.service_radius_km)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_practitioner(pool: &Pool, id: Uuid) -> Result<Option<Practitioner>> {
    let row: Option<PractitionerRow> = sqlx::query_as(
        "SELECT id, name, is_available, available_days, work_start_minute, work_end_minute, service_radius_km FROM practitioners WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(Practitioner::try_from).transpose()
}

/// Toggle the on-duty flag. Returns false for an unknown practitioner.
pub async fn set_practitioner_available(pool: &Pool, id: Uuid, available: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE practitioners SET is_available = ? WHERE id = ?")
        .bind(available)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn create_appointment(
    pool: &Pool,
    new: &NewAppointment,
    default_duration_minutes: u32,
) -> Result<Appointment> {
    let appt = Appointment {
        id: Uuid::new_v4(),
        practitioner_id: None,
        appointment_date: new.appointment_date,
        appointment_time: new.appointment_time,
        duration_minutes: new.duration_minutes.unwrap_or(default_duration_minutes),
        location_latitude: new.location_latitude,
        location_longitude: new.location_longitude,
        status: AppointmentStatus::Pending,
    };
    sqlx::query(
        "INSERT INTO appointments (id, appointment_date, start_minute, duration_minutes, location_latitude, location_longitude, status) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(appt.id.to_string())
    .bind(appt.appointment_date.format(DATE_FORMAT).to_string())
    .bind(i64::from(appt.start_minute()))
    .bind(i64::from(appt.duration_minutes))
    .bind(appt.location_latitude)
    .bind(appt.location_longitude)
    .bind(appt.status.as_str())
    .execute(pool)
    .await?;
    info!(id = %appt.id, date = %appt.appointment_date, "appointment created");
    Ok(appt)
}

pub async fn get_appointment(pool: &Pool, id: Uuid) -> Result<Option<Appointment>> {
    let row: Option<AppointmentRow> = sqlx::query_as(
        "SELECT id, practitioner_id, appointment_date, start_minute, duration_minutes, location_latitude, location_longitude, status FROM appointments WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(Appointment::try_from).transpose()
}

/// Move an appointment along its lifecycle. Returns false when the current
/// status does not allow the move or changed underneath us.
#[instrument(skip_all, fields(id = %id, next = next.as_str()))]
pub async fn transition_appointment(pool: &Pool, id: Uuid, next: AppointmentStatus) -> Result<bool> {
    let Some(current) = get_appointment(pool, id).await? else {
        return Ok(false);
    };
    if !current.status.can_transition_to(next) {
        return Ok(false);
    }
    let res = sqlx::query("UPDATE appointments SET status = ? WHERE id = ? AND status = ?")
        .bind(next.as_str())
        .bind(id.to_string())
        .bind(current.status.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}
