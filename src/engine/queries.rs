use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{availability, booked_ranges};
use super::{Engine, EngineError};

impl Engine {
    /// Free slots for a doctor on a date. Schedules and bookings are read
    /// under one guard, so the result reflects a single committed state.
    pub async fn compute_availability(
        &self,
        doctor_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<AvailableSlot>, EngineError> {
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = ds.read().await;
        Ok(availability(&guard, date))
    }

    /// Active blocks for the weekday of `date`, ordered by start time.
    pub async fn fetch_active_schedules(&self, doctor_id: Ulid, date: NaiveDate) -> Vec<ScheduleBlock> {
        let Some(ds) = self.get_doctor(&doctor_id) else {
            return vec![];
        };
        let guard = ds.read().await;
        guard.active_schedules_on(day_of_week(date)).cloned().collect()
    }

    pub async fn fetch_non_cancelled_appointments(
        &self,
        doctor_id: Ulid,
        date: NaiveDate,
    ) -> HashSet<TimeRange> {
        let Some(ds) = self.get_doctor(&doctor_id) else {
            return HashSet::new();
        };
        let guard = ds.read().await;
        booked_ranges(&guard, date)
    }

    /// Existing records in a conflict scope, minus `exclude`.
    pub async fn fetch_active_conflict_scope(
        &self,
        doctor_id: Ulid,
        scope: ConflictScope,
        exclude: Option<Ulid>,
    ) -> Vec<ScopedRange> {
        let Some(ds) = self.get_doctor(&doctor_id) else {
            return vec![];
        };
        let guard = ds.read().await;
        guard.conflict_scope(scope, exclude)
    }

    pub async fn list_doctors(&self) -> Vec<DoctorInfo> {
        let doctors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(doctors.len());
        for ds in doctors {
            let guard = ds.read().await;
            infos.push(DoctorInfo {
                id: guard.id,
                specialty: guard.specialty.clone(),
                schedule_count: guard.schedules.len(),
                appointment_count: guard.live_appointment_count(),
            });
        }
        infos.sort_by_key(|d| d.id);
        infos
    }

    pub async fn get_schedules(&self, doctor_id: Ulid) -> Vec<ScheduleBlock> {
        let Some(ds) = self.get_doctor(&doctor_id) else {
            return vec![];
        };
        let guard = ds.read().await;
        guard.schedules.clone()
    }

    /// All appointments of any status, optionally narrowed to one date.
    pub async fn get_appointments(&self, doctor_id: Ulid, date: Option<NaiveDate>) -> Vec<Appointment> {
        let Some(ds) = self.get_doctor(&doctor_id) else {
            return vec![];
        };
        let guard = ds.read().await;
        match date {
            Some(d) => guard.appointments_on(d).to_vec(),
            None => guard.appointments.clone(),
        }
    }

    pub fn get_confirmation(&self, appointment_id: &Ulid) -> Option<Confirmation> {
        let token = self
            .confirmation_by_appointment
            .get(appointment_id)
            .map(|t| t.value().clone())?;
        self.confirmation(&token)
    }

    pub fn confirmation(&self, token: &str) -> Option<Confirmation> {
        self.confirmations.get(token).map(|c| c.value().clone())
    }

    /// Confirmations still waiting for their email: not sent, not redeemed,
    /// not expired, and attached to an appointment that is not cancelled.
    pub async fn unsent_confirmations(&self, now: Ms) -> Vec<(Appointment, Confirmation)> {
        let pending: Vec<Confirmation> = self
            .confirmations
            .iter()
            .filter(|c| c.sent_at.is_none() && !c.confirmed && !c.is_expired(now))
            .map(|c| c.value().clone())
            .collect();

        let mut out = Vec::with_capacity(pending.len());
        for confirmation in pending {
            let Some(ds) = self.get_doctor(&confirmation.doctor_id) else {
                continue;
            };
            let guard = ds.read().await;
            if let Some(appointment) = guard.appointment(confirmation.appointment_id)
                && !appointment.status.is_cancelled()
            {
                out.push((appointment.clone(), confirmation));
            }
        }
        out.sort_by_key(|(a, _)| a.id);
        out
    }
}
