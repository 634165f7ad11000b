use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_appointment_conflict, check_schedule_conflict, validate_range, validate_schedule_shape,
};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Doctors ──────────────────────────────────────────────

    pub async fn register_doctor(
        &self,
        id: Ulid,
        specialty: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(ref s) = specialty
            && s.len() > MAX_SPECIALTY_LEN
        {
            return Err(EngineError::LimitExceeded("specialty too long"));
        }
        let _registry = self.registry.lock().await;
        if self.state.len() >= MAX_DOCTORS {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::DoctorRegistered {
            id,
            specialty: specialty.clone(),
        };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(DoctorState::new(id, specialty))));
        self.notify.send(id, &event);
        metrics::gauge!(crate::observability::DOCTORS_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    /// Refused while the doctor still has non-cancelled appointments.
    pub async fn remove_doctor(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let ds = self.get_doctor(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ds.write().await;
        if guard.live_appointment_count() > 0 {
            return Err(EngineError::HasAppointments(id));
        }

        let event = Event::DoctorRemoved { id };
        self.wal_append(&event).await?;
        self.forget_doctor(&guard);
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        metrics::gauge!(crate::observability::DOCTORS_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    // ── Schedules ────────────────────────────────────────────

    pub async fn add_schedule(&self, block: ScheduleBlock) -> Result<(), EngineError> {
        validate_schedule_shape(&block)?;
        let claim = self.claim_entity(block.id, block.doctor_id)?;
        let ds = self
            .get_doctor(&block.doctor_id)
            .ok_or(EngineError::NotFound(block.doctor_id))?;
        let mut guard = ds.write().await;
        if guard.schedules.len() >= MAX_SCHEDULES_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many schedule blocks for doctor"));
        }
        check_schedule_conflict(&guard, &block)?;

        let event = Event::ScheduleAdded { block };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.commit();
        Ok(())
    }

    /// Replace an existing block. The block is excluded from its own
    /// conflict scope, so shrinking or sliding it within its old window is
    /// always allowed.
    pub async fn update_schedule(&self, block: ScheduleBlock) -> Result<(), EngineError> {
        validate_schedule_shape(&block)?;
        match self.get_doctor_for_entity(&block.id) {
            None => return Err(EngineError::NotFound(block.id)),
            Some(owner) if owner != block.doctor_id => {
                return Err(EngineError::WrongDoctor {
                    id: block.id,
                    doctor_id: block.doctor_id,
                });
            }
            Some(_) => {}
        }
        let ds = self
            .get_doctor(&block.doctor_id)
            .ok_or(EngineError::NotFound(block.doctor_id))?;
        let mut guard = ds.write().await;
        if guard.schedule(block.id).is_none() {
            return Err(EngineError::NotFound(block.id));
        }
        check_schedule_conflict(&guard, &block)?;

        let event = Event::ScheduleUpdated { block };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Add the block, or update it if the id is already known.
    pub async fn upsert_schedule(&self, block: ScheduleBlock) -> Result<(), EngineError> {
        if self.entity_to_doctor.contains_key(&block.id) {
            self.update_schedule(block).await
        } else {
            self.add_schedule(block).await
        }
    }

    pub async fn remove_schedule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if guard.schedule(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let doctor_id = guard.id;
        let event = Event::ScheduleRemoved { id, doctor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(doctor_id)
    }

    // ── Appointments ─────────────────────────────────────────

    /// Book a PENDING appointment and issue its confirmation token.
    pub async fn book_appointment(
        &self,
        id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        reason: Option<String>,
    ) -> Result<Confirmation, EngineError> {
        validate_range(&range)?;
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let claim = self.claim_entity(id, doctor_id)?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let mut guard = ds.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many appointments for doctor"));
        }
        check_appointment_conflict(&guard, id, date, &range)?;

        let confirmation = Confirmation {
            token: Ulid::new().to_string(),
            appointment_id: id,
            doctor_id,
            expires_at: now_ms() + self.confirmation_ttl_ms,
            confirmed: false,
            sent_at: None,
        };
        let event = Event::AppointmentBooked {
            appointment: Appointment {
                id,
                doctor_id,
                patient_id,
                date,
                range,
                status: AppointmentStatus::Pending,
                reason,
            },
            confirmation: Some(confirmation.clone()),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.commit();
        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        Ok(confirmation)
    }

    /// Move an appointment, excluding itself from the conflict check.
    /// Cancelled appointments hold no time, so they move unchecked.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        date: NaiveDate,
        range: TimeRange,
    ) -> Result<Ulid, EngineError> {
        validate_range(&range)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if !current.status.is_cancelled() {
            check_appointment_conflict(&guard, id, date, &range)?;
        }
        let doctor_id = guard.id;
        let event = Event::AppointmentRescheduled {
            id,
            doctor_id,
            date,
            range,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(doctor_id)
    }

    /// Any transition is allowed, but leaving CANCELLED re-enters the
    /// conflict scope and must pass the overlap check again.
    pub async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard
            .appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let doctor_id = guard.id;
        if current.status == status {
            return Ok(doctor_id);
        }
        if current.status.is_cancelled() {
            check_appointment_conflict(&guard, id, current.date, &current.range)?;
        }
        let event = Event::AppointmentStatusChanged {
            id,
            doctor_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(doctor_id)
    }

    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.set_appointment_status(id, AppointmentStatus::Cancelled)
            .await
    }

    // ── Confirmations ────────────────────────────────────────

    /// Redeem a confirmation token. Redeeming an already-accepted token is
    /// a no-op that returns the appointment as it stands.
    pub async fn confirm_by_token(&self, token: &str, now: Ms) -> Result<Appointment, EngineError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(EngineError::UnknownToken);
        }
        let confirmation = self.live_confirmation(token)?;
        let ds = self
            .get_doctor(&confirmation.doctor_id)
            .ok_or(EngineError::NotFound(confirmation.doctor_id))?;
        let mut guard = ds.write().await;
        let appointment = guard
            .appointment(confirmation.appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(confirmation.appointment_id))?;

        // Re-read under the doctor lock: the reaper may have expired it meanwhile.
        let confirmation = self.live_confirmation(token)?;
        if confirmation.confirmed {
            return Ok(appointment);
        }
        if confirmation.is_expired(now) {
            return Err(EngineError::TokenExpired);
        }
        if appointment.status.is_cancelled() {
            check_appointment_conflict(&guard, appointment.id, appointment.date, &appointment.range)?;
        }

        let event = Event::ConfirmationAccepted {
            token: confirmation.token,
            doctor_id: guard.id,
            appointment_id: appointment.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .appointment(appointment.id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment.id))
    }

    /// Outstanding or redeemed confirmation. Reaped tokens stay expired.
    fn live_confirmation(&self, token: &str) -> Result<Confirmation, EngineError> {
        if let Some(c) = self.confirmations.get(token) {
            return Ok(c.value().clone());
        }
        if self.expired_tokens.contains_key(token) {
            return Err(EngineError::TokenExpired);
        }
        Err(EngineError::UnknownToken)
    }

    /// Record that the confirmation email went out. Idempotent.
    pub async fn mark_confirmation_sent(&self, token: &str, sent_at: Ms) -> Result<(), EngineError> {
        let doctor_id = self
            .confirmations
            .get(token)
            .map(|c| c.doctor_id)
            .ok_or(EngineError::UnknownToken)?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let mut guard = ds.write().await;
        let already_sent = self
            .confirmations
            .get(token)
            .map(|c| c.sent_at.is_some())
            .ok_or(EngineError::UnknownToken)?;
        if already_sent {
            return Ok(());
        }
        let event = Event::ConfirmationSent {
            token: token.to_string(),
            doctor_id,
            sent_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::CONFIRMATIONS_SENT_TOTAL).increment(1);
        Ok(())
    }

    /// Tokens that were never redeemed and are past their expiry.
    pub fn collect_expired_confirmations(&self, now: Ms) -> Vec<String> {
        self.confirmations
            .iter()
            .filter(|c| !c.confirmed && c.is_expired(now))
            .map(|c| c.token.clone())
            .collect()
    }

    pub async fn expire_confirmation(&self, token: &str, now: Ms) -> Result<(), EngineError> {
        let doctor_id = self
            .confirmations
            .get(token)
            .map(|c| c.doctor_id)
            .ok_or(EngineError::UnknownToken)?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let mut guard = ds.write().await;
        let still_expired = self
            .confirmations
            .get(token)
            .map(|c| !c.confirmed && c.is_expired(now))
            .ok_or(EngineError::UnknownToken)?;
        if !still_expired {
            return Ok(());
        }
        let event = Event::ConfirmationExpired {
            token: token.to_string(),
            doctor_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::CONFIRMATIONS_EXPIRED_TOTAL).increment(1);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Every doctor is read-locked until the new file is in place so
    /// no write can land in the old file after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut doctors: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        doctors.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(doctors.len());
        for (_, ds) in &doctors {
            guards.push(ds.clone().read_owned().await);
        }

        let mut reaped_by_appointment: HashMap<Ulid, Confirmation> = self
            .expired_tokens
            .iter()
            .map(|c| (c.appointment_id, c.value().clone()))
            .collect();

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::DoctorRegistered {
                id: guard.id,
                specialty: guard.specialty.clone(),
            });
            for block in &guard.schedules {
                events.push(Event::ScheduleAdded {
                    block: block.clone(),
                });
            }
            for appointment in &guard.appointments {
                let confirmation = self
                    .confirmation_by_appointment
                    .get(&appointment.id)
                    .and_then(|token| self.confirmations.get(token.value()).map(|c| c.value().clone()));
                let reaped = match confirmation {
                    Some(_) => None,
                    None => reaped_by_appointment.remove(&appointment.id),
                };
                events.push(Event::AppointmentBooked {
                    appointment: appointment.clone(),
                    confirmation: confirmation.or_else(|| reaped.clone()),
                });
                if let Some(c) = reaped {
                    events.push(Event::ConfirmationExpired {
                        token: c.token,
                        doctor_id: c.doctor_id,
                    });
                }
            }
        }
        let event_count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::info!("WAL compacted to {event_count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
