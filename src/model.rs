use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Mutation kinds recorded by a practitioner's handset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    Vital,
    InventoryUsage,
    VisitCheckIn,
    VisitCheckOut,
}

impl OutboxKind {
    pub const ALL: [OutboxKind; 4] = [
        OutboxKind::Vital,
        OutboxKind::InventoryUsage,
        OutboxKind::VisitCheckIn,
        OutboxKind::VisitCheckOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::Vital => "vital",
            OutboxKind::InventoryUsage => "inventory_usage",
            OutboxKind::VisitCheckIn => "visit_check_in",
            OutboxKind::VisitCheckOut => "visit_check_out",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VitalsPayload {
    pub booking_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diastolic: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respiratory_rate: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oxygen_saturation: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_glucose: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryUsagePayload {
    pub inventory_item_id: Uuid,
    pub quantity_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisitEventPayload {
    pub booking_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Kind-specific body of an outbox record. The variant is the kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxPayload {
    Vital(VitalsPayload),
    InventoryUsage(InventoryUsagePayload),
    VisitCheckIn(VisitEventPayload),
    VisitCheckOut(VisitEventPayload),
}

impl OutboxPayload {
    pub fn kind(&self) -> OutboxKind {
        match self {
            OutboxPayload::Vital(_) => OutboxKind::Vital,
            OutboxPayload::InventoryUsage(_) => OutboxKind::InventoryUsage,
            OutboxPayload::VisitCheckIn(_) => OutboxKind::VisitCheckIn,
            OutboxPayload::VisitCheckOut(_) => OutboxKind::VisitCheckOut,
        }
    }

    pub fn booking_id(&self) -> Option<Uuid> {
        match self {
            OutboxPayload::Vital(v) => Some(v.booking_id),
            OutboxPayload::InventoryUsage(u) => u.booking_id,
            OutboxPayload::VisitCheckIn(e) | OutboxPayload::VisitCheckOut(e) => Some(e.booking_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncState::Pending),
            "syncing" => Some(SyncState::Syncing),
            "synced" => Some(SyncState::Synced),
            "failed" => Some(SyncState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub kind: OutboxKind,
    pub payload: OutboxPayload,
    pub created_at: DateTime<Utc>,
    pub sync_state: SyncState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub syncing_since: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// True when a pending record's backoff window has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.sync_state == SyncState::Pending && self.next_attempt_at.map_or(true, |t| t <= now)
    }
}

/// A position reported by the platform geolocation capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryItem {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub quantity: i64,
    pub reorder_level: i64,
}

/// Set of weekdays stored as a bitmask, Monday = bit 0.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b0111_1111)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn with(mut self, day: Weekday) -> Self {
        self.0 |= 1 << day.num_days_from_monday();
        self
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<T: IntoIterator<Item = Weekday>>(iter: T) -> Self {
        iter.into_iter().fold(WeekdaySet::default(), WeekdaySet::with)
    }
}

/// Practitioner schedule and reach used by the assignment resolver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Practitioner {
    pub id: Uuid,
    pub name: String,
    pub is_available: bool,
    pub available_days: WeekdaySet,
    pub work_start_time: NaiveTime,
    pub work_end_time: NaiveTime,
    pub service_radius_km: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PractitionerLocation {
    pub practitioner_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AppointmentStatus::Pending),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "in_progress" => Some(AppointmentStatus::InProgress),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    /// Forward-only lifecycle; cancellation is allowed from any non-terminal state.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match (self, next) {
            (Pending, Confirmed) | (Confirmed, InProgress) | (InProgress, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub practitioner_id: Option<Uuid>,
    pub appointment_date: NaiveDate,
    pub appointment_time: NaiveTime,
    pub duration_minutes: u32,
    pub location_latitude: f64,
    pub location_longitude: f64,
    pub status: AppointmentStatus,
}

impl Appointment {
    pub fn weekday(&self) -> Weekday {
        self.appointment_date.weekday()
    }

    /// Minutes since midnight at which the appointment starts.
    pub fn start_minute(&self) -> u32 {
        minute_of_day(self.appointment_time)
    }
}

pub fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Result of a single assignment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned { practitioner_id: Uuid, distance_km: f64 },
    /// No practitioner passed the filter; the appointment stays pending for manual assignment.
    NoEligiblePractitioner,
    AlreadyAssigned { practitioner_id: Uuid },
    NotAssignable { status: AppointmentStatus },
}

impl AssignmentOutcome {
    pub fn practitioner_id(&self) -> Option<Uuid> {
        match self {
            AssignmentOutcome::Assigned { practitioner_id, .. } => Some(*practitioner_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_matches_kind() {
        let payload = OutboxPayload::InventoryUsage(InventoryUsagePayload {
            inventory_item_id: Uuid::nil(),
            quantity_used: 2,
            booking_id: None,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "inventory_usage");
        assert_eq!(json["quantity_used"], 2);
        assert!(json.get("booking_id").is_none());
        assert_eq!(
            OutboxKind::parse_kind(json["kind"].as_str().unwrap()),
            Some(payload.kind())
        );
    }

    #[test]
    fn kind_strings_match_serde_names() {
        for kind in OutboxKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }

    #[test]
    fn weekday_set_membership() {
        let days: WeekdaySet = [Weekday::Mon, Weekday::Wed].into_iter().collect();
        assert!(days.contains(Weekday::Mon));
        assert!(!days.contains(Weekday::Tue));
        assert!(days.contains(Weekday::Wed));
        assert_eq!(days.bits(), 0b101);
    }

    #[test]
    fn appointment_lifecycle() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Pending));
    }
}
