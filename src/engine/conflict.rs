use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_INTERVAL_MINUTES;
use crate::model::*;

use super::EngineError;

pub fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if !range.is_valid() {
        return Err(EngineError::InvalidRange(*range));
    }
    Ok(())
}

/// First record in `scope` that overlaps `candidate`, skipping `exclude`
/// (the candidate's own id when it is being updated).
pub fn find_conflict<'a>(
    candidate: &TimeRange,
    exclude: Option<Ulid>,
    scope: &'a [ScopedRange],
) -> Option<&'a ScopedRange> {
    scope
        .iter()
        .filter(|existing| Some(existing.id) != exclude)
        .find(|existing| existing.range.overlaps(candidate))
}

/// Reject-before-write gate. The range precondition is checked before any
/// overlap test; overlap is half-open, so adjacent ranges pass.
pub fn validate(
    candidate: &TimeRange,
    exclude: Option<Ulid>,
    scope: &[ScopedRange],
) -> Result<(), EngineError> {
    validate_range(candidate)?;
    if let Some(hit) = find_conflict(candidate, exclude, scope) {
        return Err(EngineError::Conflict {
            id: hit.id,
            range: hit.range,
        });
    }
    Ok(())
}

pub(crate) fn validate_schedule_shape(block: &ScheduleBlock) -> Result<(), EngineError> {
    if block.day_of_week > 6 {
        return Err(EngineError::InvalidDay(block.day_of_week));
    }
    if block.interval_minutes == 0 || block.interval_minutes > MAX_INTERVAL_MINUTES {
        return Err(EngineError::InvalidInterval(block.interval_minutes));
    }
    validate_range(&block.range)
}

/// Inactive blocks never enter a scope, so they only need a valid range.
pub(crate) fn check_schedule_conflict(
    ds: &DoctorState,
    block: &ScheduleBlock,
) -> Result<(), EngineError> {
    if !block.active {
        return validate_range(&block.range);
    }
    let scope = ds.conflict_scope(ConflictScope::Weekly(block.day_of_week), Some(block.id));
    validate(&block.range, Some(block.id), &scope).inspect_err(|_| record_conflict("schedule"))
}

pub(crate) fn check_appointment_conflict(
    ds: &DoctorState,
    id: Ulid,
    date: NaiveDate,
    range: &TimeRange,
) -> Result<(), EngineError> {
    let scope = ds.conflict_scope(ConflictScope::Dated(date), Some(id));
    validate(range, Some(id), &scope).inspect_err(|_| record_conflict("appointment"))
}

fn record_conflict(scope: &'static str) {
    metrics::counter!(crate::observability::CONFLICTS_TOTAL, "scope" => scope).increment(1);
}
