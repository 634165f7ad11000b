use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for instants (token expiry, delivery time);
/// calendar values use chrono's naive date/time types.
pub type Ms = i64;

/// ISO day of week: 0 = Monday … 6 = Sunday.
pub type DayOfWeek = u8;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub fn day_of_week(date: NaiveDate) -> DayOfWeek {
    date.weekday().num_days_from_monday() as DayOfWeek
}

/// 24-hour, zero-padded `HH:MM`. UI pickers match on this exact string.
pub fn format_hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Half-open time-of-day range `[start, end)`.
///
/// Construction does not reject inverted ranges: write paths must be able
/// to represent a bad candidate in order to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_hhmm(self.start), format_hhmm(self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::Completed => "COMPLETED",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "PENDING" => Some(AppointmentStatus::Pending),
            "CONFIRMED" => Some(AppointmentStatus::Confirmed),
            "CANCELLED" => Some(AppointmentStatus::Cancelled),
            "COMPLETED" => Some(AppointmentStatus::Completed),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppointmentStatus::Cancelled)
    }
}

/// A weekly recurring availability window for one doctor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleBlock {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub day_of_week: DayOfWeek,
    pub range: TimeRange,
    pub interval_minutes: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
}

/// Email confirmation issued when an appointment is booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub token: String,
    pub appointment_id: Ulid,
    pub doctor_id: Ulid,
    pub expires_at: Ms,
    pub confirmed: bool,
    pub sent_at: Option<Ms>,
}

impl Confirmation {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// A bookable tile of a schedule block. Serialized as
/// `{"start_time": "HH:MM", "end_time": "HH:MM"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableSlot {
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl From<TimeRange> for AvailableSlot {
    fn from(range: TimeRange) -> Self {
        Self {
            start_time: range.start,
            end_time: range.end,
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_hhmm(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M").map_err(serde::de::Error::custom)
    }
}

/// The grouping within which overlap is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictScope {
    /// Schedule blocks: (doctor, day of week).
    Weekly(DayOfWeek),
    /// Appointments: (doctor, date).
    Dated(NaiveDate),
}

/// An existing record as seen by the conflict validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopedRange {
    pub id: Ulid,
    pub range: TimeRange,
}

#[derive(Debug, Clone)]
pub struct DoctorState {
    pub id: Ulid,
    pub specialty: Option<String>,
    /// Sorted by `(day_of_week, range.start)`.
    pub schedules: Vec<ScheduleBlock>,
    /// Sorted by `(date, range.start)`.
    pub appointments: Vec<Appointment>,
}

impl DoctorState {
    pub fn new(id: Ulid, specialty: Option<String>) -> Self {
        Self {
            id,
            specialty,
            schedules: Vec::new(),
            appointments: Vec::new(),
        }
    }

    // ── Schedules ────────────────────────────────────────────

    /// Insert keeping `(day, start)` order; equal keys keep insertion order.
    pub fn insert_schedule(&mut self, block: ScheduleBlock) {
        let key = (block.day_of_week, block.range.start);
        let pos = self
            .schedules
            .partition_point(|s| (s.day_of_week, s.range.start) <= key);
        self.schedules.insert(pos, block);
    }

    pub fn remove_schedule(&mut self, id: Ulid) -> Option<ScheduleBlock> {
        let pos = self.schedules.iter().position(|s| s.id == id)?;
        Some(self.schedules.remove(pos))
    }

    pub fn schedule(&self, id: Ulid) -> Option<&ScheduleBlock> {
        self.schedules.iter().find(|s| s.id == id)
    }

    /// All blocks for one weekday, ordered by start time.
    pub fn schedules_on(&self, day: DayOfWeek) -> &[ScheduleBlock] {
        let lo = self.schedules.partition_point(|s| s.day_of_week < day);
        let hi = self.schedules.partition_point(|s| s.day_of_week <= day);
        &self.schedules[lo..hi]
    }

    pub fn active_schedules_on(&self, day: DayOfWeek) -> impl Iterator<Item = &ScheduleBlock> {
        self.schedules_on(day).iter().filter(|s| s.active)
    }

    // ── Appointments ─────────────────────────────────────────

    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let key = (appointment.date, appointment.range.start);
        let pos = self
            .appointments
            .partition_point(|a| (a.date, a.range.start) <= key);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// All appointments on one date (any status), ordered by start time.
    pub fn appointments_on(&self, date: NaiveDate) -> &[Appointment] {
        let lo = self.appointments.partition_point(|a| a.date < date);
        let hi = self.appointments.partition_point(|a| a.date <= date);
        &self.appointments[lo..hi]
    }

    pub fn live_appointment_count(&self) -> usize {
        self.appointments
            .iter()
            .filter(|a| !a.status.is_cancelled())
            .count()
    }

    // ── Conflict scopes ──────────────────────────────────────

    /// Existing records that a candidate in `scope` must not overlap:
    /// active blocks for a weekday, or non-cancelled appointments for a date.
    pub fn conflict_scope(&self, scope: ConflictScope, exclude: Option<Ulid>) -> Vec<ScopedRange> {
        match scope {
            ConflictScope::Weekly(day) => self
                .active_schedules_on(day)
                .filter(|s| Some(s.id) != exclude)
                .map(|s| ScopedRange { id: s.id, range: s.range })
                .collect(),
            ConflictScope::Dated(date) => self
                .appointments_on(date)
                .iter()
                .filter(|a| !a.status.is_cancelled() && Some(a.id) != exclude)
                .map(|a| ScopedRange { id: a.id, range: a.range })
                .collect(),
        }
    }
}

/// The event types. Flat, no nesting beyond the record payloads.
/// This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DoctorRegistered {
        id: Ulid,
        specialty: Option<String>,
    },
    DoctorRemoved {
        id: Ulid,
    },
    ScheduleAdded {
        block: ScheduleBlock,
    },
    ScheduleUpdated {
        block: ScheduleBlock,
    },
    ScheduleRemoved {
        id: Ulid,
        doctor_id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
        confirmation: Option<Confirmation>,
    },
    AppointmentRescheduled {
        id: Ulid,
        doctor_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
    },
    AppointmentStatusChanged {
        id: Ulid,
        doctor_id: Ulid,
        status: AppointmentStatus,
    },
    ConfirmationSent {
        token: String,
        doctor_id: Ulid,
        sent_at: Ms,
    },
    ConfirmationAccepted {
        token: String,
        doctor_id: Ulid,
        appointment_id: Ulid,
    },
    ConfirmationExpired {
        token: String,
        doctor_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorInfo {
    pub id: Ulid,
    pub specialty: Option<String>,
    pub schedule_count: usize,
    pub appointment_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn block(day: DayOfWeek, start: NaiveTime, end: NaiveTime, active: bool) -> ScheduleBlock {
        ScheduleBlock {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            day_of_week: day,
            range: TimeRange::new(start, end),
            interval_minutes: 30,
            active,
        }
    }

    fn appt(date: NaiveDate, start: NaiveTime, end: NaiveTime, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            patient_id: Ulid::new(),
            date,
            range: TimeRange::new(start, end),
            status,
            reason: None,
        }
    }

    #[test]
    fn range_basics() {
        let r = TimeRange::new(t(9, 0), t(9, 30));
        assert!(r.is_valid());
        assert_eq!(r.duration_minutes(), 30);
        assert!(!TimeRange::new(t(9, 30), t(9, 30)).is_valid());
        assert!(!TimeRange::new(t(10, 0), t(9, 0)).is_valid());
        assert_eq!(r.to_string(), "[09:00, 09:30)");
    }

    #[test]
    fn range_overlap() {
        let a = TimeRange::new(t(9, 0), t(9, 30));
        let b = TimeRange::new(t(9, 15), t(9, 45));
        let c = TimeRange::new(t(9, 30), t(10, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn weekday_is_iso_monday_zero() {
        // 2024-01-01 was a Monday.
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(day_of_week(monday), 0);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()), 6);
    }

    #[test]
    fn status_labels() {
        for s in [
            AppointmentStatus::Pending,
            AppointmentStatus::Confirmed,
            AppointmentStatus::Cancelled,
            AppointmentStatus::Completed,
        ] {
            assert_eq!(AppointmentStatus::from_label(s.as_str()), Some(s));
        }
        assert_eq!(AppointmentStatus::from_label("cancelled"), Some(AppointmentStatus::Cancelled));
        assert_eq!(AppointmentStatus::from_label("LOST"), None);
    }

    #[test]
    fn schedules_kept_in_day_then_start_order() {
        let mut ds = DoctorState::new(Ulid::new(), None);
        ds.insert_schedule(block(2, t(14, 0), t(16, 0), true));
        ds.insert_schedule(block(0, t(9, 0), t(12, 0), true));
        ds.insert_schedule(block(2, t(8, 0), t(10, 0), true));
        let order: Vec<_> = ds
            .schedules
            .iter()
            .map(|s| (s.day_of_week, s.range.start))
            .collect();
        assert_eq!(order, vec![(0, t(9, 0)), (2, t(8, 0)), (2, t(14, 0))]);
        assert_eq!(ds.schedules_on(2).len(), 2);
        assert!(ds.schedules_on(5).is_empty());
    }

    #[test]
    fn active_schedules_skip_inactive() {
        let mut ds = DoctorState::new(Ulid::new(), None);
        ds.insert_schedule(block(1, t(9, 0), t(12, 0), false));
        ds.insert_schedule(block(1, t(13, 0), t(15, 0), true));
        let active: Vec<_> = ds.active_schedules_on(1).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].range.start, t(13, 0));
    }

    #[test]
    fn appointments_sliced_by_date() {
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let mut ds = DoctorState::new(Ulid::new(), None);
        ds.insert_appointment(appt(d2, t(9, 0), t(9, 30), AppointmentStatus::Pending));
        ds.insert_appointment(appt(d1, t(11, 0), t(11, 30), AppointmentStatus::Pending));
        ds.insert_appointment(appt(d1, t(9, 0), t(9, 30), AppointmentStatus::Cancelled));
        let on_d1 = ds.appointments_on(d1);
        assert_eq!(on_d1.len(), 2);
        assert_eq!(on_d1[0].range.start, t(9, 0));
        assert_eq!(ds.appointments_on(d2).len(), 1);
        assert_eq!(ds.live_appointment_count(), 2);
    }

    #[test]
    fn conflict_scope_filters_cancelled_and_excluded() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let mut ds = DoctorState::new(Ulid::new(), None);
        let kept = appt(d, t(9, 0), t(9, 30), AppointmentStatus::Confirmed);
        let excluded = appt(d, t(10, 0), t(10, 30), AppointmentStatus::Pending);
        let kept_id = kept.id;
        let excluded_id = excluded.id;
        ds.insert_appointment(kept);
        ds.insert_appointment(excluded);
        ds.insert_appointment(appt(d, t(11, 0), t(11, 30), AppointmentStatus::Cancelled));

        let scope = ds.conflict_scope(ConflictScope::Dated(d), Some(excluded_id));
        assert_eq!(scope.len(), 1);
        assert_eq!(scope[0].id, kept_id);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut ds = DoctorState::new(Ulid::new(), None);
        ds.insert_schedule(block(0, t(9, 0), t(10, 0), true));
        assert!(ds.remove_schedule(Ulid::new()).is_none());
        assert!(ds.remove_appointment(Ulid::new()).is_none());
        assert_eq!(ds.schedules.len(), 1);
    }

    #[test]
    fn available_slot_serializes_as_hhmm() {
        let slot = AvailableSlot::from(TimeRange::new(t(9, 0), t(9, 30)));
        let json = serde_json::to_string(&slot).unwrap();
        assert_eq!(json, r#"{"start_time":"09:00","end_time":"09:30"}"#);
        let back: AvailableSlot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, slot);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ScheduleAdded {
            block: block(3, t(8, 0), t(12, 0), true),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
