use ulid::Ulid;

use crate::model::TimeRange;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Start is not strictly before end.
    InvalidRange(TimeRange),
    InvalidDay(u8),
    InvalidInterval(u32),
    /// Candidate overlaps an existing record in the same scope.
    Conflict {
        id: Ulid,
        range: TimeRange,
    },
    /// Record exists but belongs to another doctor.
    WrongDoctor {
        id: Ulid,
        doctor_id: Ulid,
    },
    HasAppointments(Ulid),
    UnknownToken,
    TokenExpired,
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidRange(range) => {
                write!(f, "invalid range {range}: start must be before end")
            }
            EngineError::InvalidDay(day) => {
                write!(f, "invalid day of week {day}: expected 0 (Monday) to 6 (Sunday)")
            }
            EngineError::InvalidInterval(minutes) => {
                write!(f, "invalid interval {minutes} minutes")
            }
            EngineError::Conflict { id, range } => {
                write!(f, "conflict with {id} at {range}")
            }
            EngineError::WrongDoctor { id, doctor_id } => {
                write!(f, "{id} does not belong to doctor {doctor_id}")
            }
            EngineError::HasAppointments(id) => {
                write!(f, "cannot remove doctor {id}: has active appointments")
            }
            EngineError::UnknownToken => write!(f, "unknown confirmation token"),
            EngineError::TokenExpired => write!(f, "confirmation token expired"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
