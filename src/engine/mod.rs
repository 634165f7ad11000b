mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{available_slots, availability, booked_ranges, tile_block};
pub use conflict::{find_conflict, validate, validate_range};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// One lock per doctor. Holding the write guard serializes every
/// check-then-insert against that doctor's schedules and appointments.
pub type SharedDoctorState = Arc<RwLock<DoctorState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Blocks for the first append, drains whatever else is
/// already queued, then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so half-written bytes do not leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedDoctorState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: schedule/appointment id → doctor id.
    pub(super) entity_to_doctor: DashMap<Ulid, Ulid>,
    /// Outstanding confirmation tokens.
    pub(super) confirmations: DashMap<String, Confirmation>,
    pub(super) confirmation_by_appointment: DashMap<Ulid, String>,
    /// Reaped tokens, kept so a late redemption reads as expired rather
    /// than unknown.
    pub(super) expired_tokens: DashMap<String, Confirmation>,
    pub(super) confirmation_ttl_ms: Ms,
    /// Held by doctor registration/removal and by compaction, which must
    /// see a stable set of doctors.
    pub(super) registry: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, confirmation_ttl_ms: Ms) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_doctor: DashMap::new(),
            confirmations: DashMap::new(),
            confirmation_by_appointment: DashMap::new(),
            expired_tokens: DashMap::new(),
            confirmation_ttl_ms,
            registry: tokio::sync::Mutex::new(()),
        };

        // Sole owner of every Arc during replay, so try_write cannot fail.
        // blocking_write would panic inside the runtime.
        for event in &events {
            match event {
                Event::DoctorRegistered { id, specialty } => {
                    let ds = DoctorState::new(*id, specialty.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(ds)));
                }
                Event::DoctorRemoved { id } => {
                    if let Some((_, ds)) = engine.state.remove(id)
                        && let Ok(guard) = ds.try_read()
                    {
                        engine.forget_doctor(&guard);
                    }
                }
                other => {
                    let Some(doctor_id) = event_doctor_id(other) else {
                        continue;
                    };
                    let Some(ds) = engine.get_doctor(&doctor_id) else {
                        tracing::warn!("replay: event for unknown doctor {doctor_id} skipped");
                        continue;
                    };
                    if let Ok(mut guard) = ds.try_write() {
                        engine.apply(&mut guard, other);
                    }
                }
            }
        }

        tracing::info!(
            "replayed {} WAL events: {} doctors, {} open confirmations",
            events.len(),
            engine.state.len(),
            engine.confirmations.len()
        );
        metrics::gauge!(crate::observability::DOCTORS_ACTIVE).set(engine.state.len() as f64);
        Ok(engine)
    }

    /// Apply an event to one doctor's state. Caller holds the write lock.
    /// Registration and removal are handled at the map level.
    pub(super) fn apply(&self, ds: &mut DoctorState, event: &Event) {
        match event {
            Event::ScheduleAdded { block } => {
                self.entity_to_doctor.insert(block.id, ds.id);
                ds.insert_schedule(block.clone());
            }
            Event::ScheduleUpdated { block } => {
                ds.remove_schedule(block.id);
                self.entity_to_doctor.insert(block.id, ds.id);
                ds.insert_schedule(block.clone());
            }
            Event::ScheduleRemoved { id, .. } => {
                ds.remove_schedule(*id);
                self.entity_to_doctor.remove(id);
            }
            Event::AppointmentBooked {
                appointment,
                confirmation,
            } => {
                self.entity_to_doctor.insert(appointment.id, ds.id);
                ds.insert_appointment(appointment.clone());
                if let Some(c) = confirmation {
                    self.confirmation_by_appointment
                        .insert(c.appointment_id, c.token.clone());
                    self.confirmations.insert(c.token.clone(), c.clone());
                }
            }
            Event::AppointmentRescheduled { id, date, range, .. } => {
                if let Some(mut appointment) = ds.remove_appointment(*id) {
                    appointment.date = *date;
                    appointment.range = *range;
                    ds.insert_appointment(appointment);
                }
            }
            Event::AppointmentStatusChanged { id, status, .. } => {
                if let Some(appointment) = ds.appointment_mut(*id) {
                    appointment.status = *status;
                }
            }
            Event::ConfirmationSent { token, sent_at, .. } => {
                if let Some(mut c) = self.confirmations.get_mut(token) {
                    c.sent_at = Some(*sent_at);
                }
            }
            Event::ConfirmationAccepted {
                token,
                appointment_id,
                ..
            } => {
                if let Some(mut c) = self.confirmations.get_mut(token) {
                    c.confirmed = true;
                }
                if let Some(appointment) = ds.appointment_mut(*appointment_id)
                    && appointment.status != AppointmentStatus::Completed
                {
                    appointment.status = AppointmentStatus::Confirmed;
                }
            }
            Event::ConfirmationExpired { token, .. } => {
                if let Some((_, c)) = self.confirmations.remove(token) {
                    self.confirmation_by_appointment.remove(&c.appointment_id);
                    self.expired_tokens.insert(c.token.clone(), c);
                }
            }
            Event::DoctorRegistered { .. } | Event::DoctorRemoved { .. } => {}
        }
    }

    /// Drop every index entry that points into a removed doctor.
    pub(super) fn forget_doctor(&self, ds: &DoctorState) {
        for s in &ds.schedules {
            self.entity_to_doctor.remove(&s.id);
        }
        for a in &ds.appointments {
            self.entity_to_doctor.remove(&a.id);
            if let Some((_, token)) = self.confirmation_by_appointment.remove(&a.id) {
                self.confirmations.remove(&token);
            }
        }
        self.expired_tokens
            .retain(|_, c| ds.appointment(c.appointment_id).is_none());
    }

    /// Claim a new schedule/appointment id for `doctor_id` before any doctor
    /// lock is taken. Of several concurrent writers with the same id exactly
    /// one gets the claim; the rest see `AlreadyExists`.
    pub(super) fn claim_entity(
        &self,
        id: Ulid,
        doctor_id: Ulid,
    ) -> Result<EntityClaim<'_>, EngineError> {
        match self.entity_to_doctor.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(doctor_id);
                Ok(EntityClaim {
                    index: &self.entity_to_doctor,
                    id,
                    committed: false,
                })
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_doctor(&self, id: &Ulid) -> Option<SharedDoctorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_doctor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_doctor.get(entity_id).map(|e| *e.value())
    }

    /// WAL first, then state, then subscribers. Nothing is applied if the
    /// append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ds: &mut DoctorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(ds, event);
        self.notify.send(ds.id, event);
        Ok(())
    }

    /// Lookup entity → doctor, acquire that doctor's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        let doctor_id = self
            .get_doctor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        Ok(ds.write_owned().await)
    }
}

/// Reservation in the entity index. Released on drop unless the write
/// committed, so a failed or abandoned write frees the id again.
pub(super) struct EntityClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    committed: bool,
}

impl EntityClaim<'_> {
    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for EntityClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.remove(&self.id);
        }
    }
}

/// The doctor an event belongs to (None for map-level events).
fn event_doctor_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ScheduleAdded { block } | Event::ScheduleUpdated { block } => Some(block.doctor_id),
        Event::AppointmentBooked { appointment, .. } => Some(appointment.doctor_id),
        Event::ScheduleRemoved { doctor_id, .. }
        | Event::AppointmentRescheduled { doctor_id, .. }
        | Event::AppointmentStatusChanged { doctor_id, .. }
        | Event::ConfirmationSent { doctor_id, .. }
        | Event::ConfirmationAccepted { doctor_id, .. }
        | Event::ConfirmationExpired { doctor_id, .. } => Some(*doctor_id),
        Event::DoctorRegistered { .. } | Event::DoctorRemoved { .. } => None,
    }
}
