//! Nearest-practitioner assignment.
//!
//! Ranking is a pure function over a snapshot of candidates. The write is a
//! single compare-and-set `UPDATE` that re-checks, under SQLite's write lock,
//! that the appointment is still open and the practitioner still free for
//! that slot. Losing the race just moves on to the next candidate.

use crate::db::model::from_micros;
use crate::db::Pool;
use crate::geo::haversine_km;
use crate::model::{
    minute_of_day, Appointment, AppointmentStatus, AssignmentOutcome, Practitioner, PractitionerLocation,
};
use crate::server::schedule::{self, PractitionerRow, DATE_FORMAT};
use anyhow::{anyhow, Result};
use std::cmp::Ordering;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Everything the ranking needs to know about one practitioner for one appointment.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub practitioner: Practitioner,
    pub location: Option<PractitionerLocation>,
    /// Non-cancelled appointments already assigned on the appointment's date.
    pub appointments_that_day: u32,
    /// An overlapping non-cancelled appointment exists on that date.
    pub has_conflict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    pub practitioner_id: Uuid,
    pub distance_km: f64,
    pub appointments_that_day: u32,
}

/// Distance to the appointment if the candidate may take it.
pub fn eligible_distance(appt: &Appointment, c: &Candidate) -> Option<f64> {
    let p = &c.practitioner;
    if !p.is_available || c.has_conflict || !p.available_days.contains(appt.weekday()) {
        return None;
    }
    let start = appt.start_minute();
    if start < minute_of_day(p.work_start_time) || start >= minute_of_day(p.work_end_time) {
        return None;
    }
    let loc = c.location.as_ref()?;
    let d = haversine_km(
        loc.latitude,
        loc.longitude,
        appt.location_latitude,
        appt.location_longitude,
    );
    (d <= p.service_radius_km).then_some(d)
}

/// Eligible candidates, best first.
///
/// Repeatedly takes every candidate within `epsilon_km` of the nearest one
/// left and picks the least loaded, then the lowest id. With `epsilon_km = 0`
/// this is plain nearest-first.
pub fn rank_candidates(appt: &Appointment, candidates: &[Candidate], epsilon_km: f64) -> Vec<RankedCandidate> {
    let mut left: Vec<RankedCandidate> = candidates
        .iter()
        .filter_map(|c| {
            eligible_distance(appt, c).map(|distance_km| RankedCandidate {
                practitioner_id: c.practitioner.id,
                distance_km,
                appointments_that_day: c.appointments_that_day,
            })
        })
        .collect();
    let epsilon = if epsilon_km.is_finite() { epsilon_km.max(0.0) } else { 0.0 };

    let mut ranked = Vec::with_capacity(left.len());
    while !left.is_empty() {
        let nearest = left.iter().map(|c| c.distance_km).fold(f64::INFINITY, f64::min);
        let pick = left
            .iter()
            .enumerate()
            .filter(|(_, c)| c.distance_km <= nearest + epsilon)
            .min_by(|(_, a), (_, b)| tie_break(a, b))
            .map(|(i, _)| i);
        let Some(i) = pick else { break };
        ranked.push(left.remove(i));
    }
    ranked
}

fn tie_break(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    a.appointments_that_day
        .cmp(&b.appointments_that_day)
        .then_with(|| a.practitioner_id.cmp(&b.practitioner_id))
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CandidateRow {
    #[sqlx(flatten)]
    practitioner: PractitionerRow,
    latitude: Option<f64>,
    longitude: Option<f64>,
    accuracy: Option<f64>,
    recorded_at: Option<i64>,
    day_load: i64,
    has_conflict: i64,
}

impl TryFrom<CandidateRow> for Candidate {
    type Error = anyhow::Error;

    fn try_from(row: CandidateRow) -> Result<Self> {
        let practitioner = Practitioner::try_from(row.practitioner)?;
        let location = match (row.latitude, row.longitude, row.recorded_at) {
            (Some(latitude), Some(longitude), Some(recorded_at)) => Some(PractitionerLocation {
                practitioner_id: practitioner.id,
                latitude,
                longitude,
                accuracy: row.accuracy,
                recorded_at: from_micros(recorded_at)?,
            }),
            _ => None,
        };
        Ok(Candidate {
            practitioner,
            location,
            appointments_that_day: u32::try_from(row.day_load).unwrap_or(u32::MAX),
            has_conflict: row.has_conflict != 0,
        })
    }
}

#[derive(Clone)]
pub struct AssignmentResolver {
    pool: Pool,
    tie_epsilon_km: f64,
}

impl AssignmentResolver {
    pub fn new(pool: Pool, tie_epsilon_km: f64) -> Self {
        Self { pool, tie_epsilon_km }
    }

    #[instrument(skip_all, fields(appointment_id = %appointment_id))]
    pub async fn assign(&self, appointment_id: Uuid) -> Result<AssignmentOutcome> {
        let appt = self.load_open(appointment_id).await?;
        let appt = match appt {
            Ok(appt) => appt,
            Err(outcome) => return Ok(outcome),
        };

        let candidates = self.load_candidates(&appt).await?;
        let ranked = rank_candidates(&appt, &candidates, self.tie_epsilon_km);
        debug!(considered = candidates.len(), eligible = ranked.len(), "ranked practitioners");

        for cand in &ranked {
            if self.try_claim(appt.id, cand.practitioner_id).await? {
                info!(
                    practitioner_id = %cand.practitioner_id,
                    distance_km = cand.distance_km,
                    "appointment assigned"
                );
                return Ok(AssignmentOutcome::Assigned {
                    practitioner_id: cand.practitioner_id,
                    distance_km: cand.distance_km,
                });
            }
            // Lost the race: someone assigned this appointment or booked the practitioner.
            debug!(practitioner_id = %cand.practitioner_id, "assignment lost; re-reading");
            if let Err(outcome) = self.load_open(appointment_id).await? {
                return Ok(outcome);
            }
        }

        info!("no eligible practitioner; left pending for manual assignment");
        Ok(AssignmentOutcome::NoEligiblePractitioner)
    }

    /// The appointment if it is still pending and unassigned, otherwise the
    /// outcome explaining why not.
    async fn load_open(&self, appointment_id: Uuid) -> Result<std::result::Result<Appointment, AssignmentOutcome>> {
        let appt = schedule::get_appointment(&self.pool, appointment_id)
            .await?
            .ok_or_else(|| anyhow!("appointment {} not found", appointment_id))?;
        if let Some(practitioner_id) = appt.practitioner_id {
            return Ok(Err(AssignmentOutcome::AlreadyAssigned { practitioner_id }));
        }
        if appt.status != AppointmentStatus::Pending {
            return Ok(Err(AssignmentOutcome::NotAssignable { status: appt.status }));
        }
        Ok(Ok(appt))
    }

    #[instrument(skip_all)]
    pub async fn load_candidates(&self, appt: &Appointment) -> Result<Vec<Candidate>> {
        let rows: Vec<CandidateRow> = sqlx::query_as(
            "SELECT p.id, p.name, p.is_available, p.available_days, p.work_start_minute, p.work_end_minute, p.service_radius_km, \
                    l.latitude, l.longitude, l.accuracy, l.recorded_at, \
                    (SELECT COUNT(*) FROM appointments a \
                      WHERE a.practitioner_id = p.id AND a.appointment_date = ?1 AND a.status != 'cancelled') AS day_load, \
                    EXISTS (SELECT 1 FROM appointments a \
                      WHERE a.practitioner_id = p.id AND a.appointment_date = ?1 AND a.status != 'cancelled' AND a.id != ?4 \
                        AND a.start_minute < ?2 + ?3 AND ?2 < a.start_minute + a.duration_minutes) AS has_conflict \
             FROM practitioners p LEFT JOIN practitioner_locations l ON l.practitioner_id = p.id",
        )
        .bind(appt.appointment_date.format(DATE_FORMAT).to_string())
        .bind(i64::from(appt.start_minute()))
        .bind(i64::from(appt.duration_minutes))
        .bind(appt.id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Candidate::try_from).collect()
    }

    /// Compare-and-set the practitioner onto the appointment.
    async fn try_claim(&self, appointment_id: Uuid, practitioner_id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE appointments SET practitioner_id = ?1 \
             WHERE id = ?2 AND practitioner_id IS NULL AND status = 'pending' \
               AND EXISTS (SELECT 1 FROM practitioners p WHERE p.id = ?1 AND p.is_available = 1) \
               AND NOT EXISTS (SELECT 1 FROM appointments o \
                 WHERE o.practitioner_id = ?1 AND o.id != ?2 AND o.status != 'cancelled' \
                   AND o.appointment_date = appointments.appointment_date \
                   AND o.start_minute < appointments.start_minute + appointments.duration_minutes \
                   AND appointments.start_minute < o.start_minute + o.duration_minutes)",
        )
        .bind(practitioner_id.to_string())
        .bind(appointment_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
