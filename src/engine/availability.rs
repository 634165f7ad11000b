use std::collections::HashSet;

use chrono::{NaiveDate, TimeDelta};

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Tile a block into consecutive `interval_minutes` ranges starting at its
/// start. A trailing partial tile that would pass the block's end is
/// dropped, not truncated. Inverted or empty blocks yield nothing.
pub fn tile_block(date: NaiveDate, block: &ScheduleBlock) -> Vec<TimeRange> {
    let mut tiles = Vec::new();
    if block.interval_minutes == 0 {
        return tiles;
    }
    let step = TimeDelta::minutes(i64::from(block.interval_minutes));
    // Anchored on the date so the last step may land on midnight without wrapping.
    let end = date.and_time(block.range.end);
    let mut current = date.and_time(block.range.start);
    while current + step <= end {
        let next = current + step;
        tiles.push(TimeRange::new(current.time(), next.time()));
        current = next;
    }
    tiles
}

/// Tiles of every active block minus the booked set.
///
/// Booked membership is an exact `(start, end)` match: an appointment that
/// only partially overlaps a tile does not remove it. Output keeps block
/// order, then chronological order within a block; overlapping blocks are
/// not merged or deduplicated.
pub fn available_slots<'a>(
    date: NaiveDate,
    blocks: impl IntoIterator<Item = &'a ScheduleBlock>,
    booked: &HashSet<TimeRange>,
) -> Vec<AvailableSlot> {
    let mut slots = Vec::new();
    for block in blocks.into_iter().filter(|b| b.active) {
        for tile in tile_block(date, block) {
            if !booked.contains(&tile) {
                slots.push(AvailableSlot::from(tile));
            }
        }
    }
    slots
}

/// Exact ranges held by non-cancelled appointments on `date`.
pub fn booked_ranges(ds: &DoctorState, date: NaiveDate) -> HashSet<TimeRange> {
    ds.appointments_on(date)
        .iter()
        .filter(|a| !a.status.is_cancelled())
        .map(|a| a.range)
        .collect()
}

/// Free slots for one doctor on one date, read from a single snapshot.
pub fn availability(ds: &DoctorState, date: NaiveDate) -> Vec<AvailableSlot> {
    let booked = booked_ranges(ds, date);
    available_slots(date, ds.active_schedules_on(day_of_week(date)), &booked)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;
    use ulid::Ulid;

    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    /// 2024-01-01 was a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn block(start: NaiveTime, end: NaiveTime, interval: u32) -> ScheduleBlock {
        ScheduleBlock {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            day_of_week: 0,
            range: TimeRange::new(start, end),
            interval_minutes: interval,
            active: true,
        }
    }

    fn slot(start: NaiveTime, end: NaiveTime) -> AvailableSlot {
        AvailableSlot::from(TimeRange::new(start, end))
    }

    fn doctor_with(blocks: Vec<ScheduleBlock>, booked: Vec<(TimeRange, AppointmentStatus)>) -> DoctorState {
        let mut ds = DoctorState::new(Ulid::new(), None);
        for b in blocks {
            ds.insert_schedule(b);
        }
        for (range, status) in booked {
            ds.insert_appointment(Appointment {
                id: Ulid::new(),
                doctor_id: ds.id,
                patient_id: Ulid::new(),
                date: monday(),
                range,
                status,
                reason: None,
            });
        }
        ds
    }

    // ── tile_block ────────────────────────────────────────

    #[test]
    fn tiles_hour_into_two_half_hours() {
        let tiles = tile_block(monday(), &block(t(9, 0), t(10, 0), 30));
        assert_eq!(
            tiles,
            vec![
                TimeRange::new(t(9, 0), t(9, 30)),
                TimeRange::new(t(9, 30), t(10, 0)),
            ]
        );
    }

    #[test]
    fn trailing_partial_tile_dropped() {
        let tiles = tile_block(monday(), &block(t(9, 0), t(9, 50), 30));
        assert_eq!(tiles, vec![TimeRange::new(t(9, 0), t(9, 30))]);
    }

    #[test]
    fn inverted_or_empty_block_yields_nothing() {
        assert!(tile_block(monday(), &block(t(10, 0), t(9, 0), 30)).is_empty());
        assert!(tile_block(monday(), &block(t(9, 0), t(9, 0), 30)).is_empty());
        assert!(tile_block(monday(), &block(t(9, 0), t(9, 20), 30)).is_empty());
    }

    #[test]
    fn zero_interval_yields_nothing() {
        assert!(tile_block(monday(), &block(t(9, 0), t(10, 0), 0)).is_empty());
    }

    #[test]
    fn block_ending_before_midnight_does_not_wrap() {
        let tiles = tile_block(monday(), &block(t(23, 0), t(23, 59), 30));
        assert_eq!(tiles, vec![TimeRange::new(t(23, 0), t(23, 30))]);
    }

    // ── available_slots ───────────────────────────────────

    #[test]
    fn no_bookings_returns_all_tiles() {
        let ds = doctor_with(vec![block(t(9, 0), t(10, 0), 30)], vec![]);
        assert_eq!(
            availability(&ds, monday()),
            vec![slot(t(9, 0), t(9, 30)), slot(t(9, 30), t(10, 0))]
        );
    }

    #[test]
    fn booked_tile_excluded() {
        let ds = doctor_with(
            vec![block(t(9, 0), t(10, 0), 30)],
            vec![(TimeRange::new(t(9, 30), t(10, 0)), AppointmentStatus::Pending)],
        );
        assert_eq!(availability(&ds, monday()), vec![slot(t(9, 0), t(9, 30))]);
    }

    #[test]
    fn confirmed_and_completed_also_block() {
        let ds = doctor_with(
            vec![block(t(9, 0), t(10, 0), 30)],
            vec![
                (TimeRange::new(t(9, 0), t(9, 30)), AppointmentStatus::Confirmed),
                (TimeRange::new(t(9, 30), t(10, 0)), AppointmentStatus::Completed),
            ],
        );
        assert!(availability(&ds, monday()).is_empty());
    }

    #[test]
    fn cancelled_booking_ignored() {
        let ds = doctor_with(
            vec![block(t(9, 0), t(10, 0), 30)],
            vec![(TimeRange::new(t(9, 30), t(10, 0)), AppointmentStatus::Cancelled)],
        );
        assert_eq!(
            availability(&ds, monday()),
            vec![slot(t(9, 0), t(9, 30)), slot(t(9, 30), t(10, 0))]
        );
    }

    #[test]
    fn off_grid_booking_does_not_remove_overlapping_tile() {
        // Only exact (start, end) matches are removed. An appointment made on
        // a 20-minute grid leaves the 30-minute tiles it straddles in place.
        let ds = doctor_with(
            vec![block(t(9, 0), t(10, 0), 30)],
            vec![(TimeRange::new(t(9, 20), t(9, 40)), AppointmentStatus::Pending)],
        );
        assert_eq!(
            availability(&ds, monday()),
            vec![slot(t(9, 0), t(9, 30)), slot(t(9, 30), t(10, 0))]
        );
    }

    #[test]
    fn no_schedule_for_weekday_is_empty() {
        let mut tuesday_block = block(t(9, 0), t(10, 0), 30);
        tuesday_block.day_of_week = 1;
        let ds = doctor_with(vec![tuesday_block], vec![]);
        assert!(availability(&ds, monday()).is_empty());
    }

    #[test]
    fn inactive_block_not_tiled() {
        let mut inactive = block(t(9, 0), t(10, 0), 30);
        inactive.active = false;
        let ds = doctor_with(vec![inactive, block(t(14, 0), t(14, 30), 30)], vec![]);
        assert_eq!(availability(&ds, monday()), vec![slot(t(14, 0), t(14, 30))]);
    }

    #[test]
    fn blocks_emitted_in_start_order() {
        let ds = doctor_with(
            vec![block(t(14, 0), t(15, 0), 60), block(t(8, 0), t(9, 0), 20)],
            vec![],
        );
        assert_eq!(
            availability(&ds, monday()),
            vec![
                slot(t(8, 0), t(8, 20)),
                slot(t(8, 20), t(8, 40)),
                slot(t(8, 40), t(9, 0)),
                slot(t(14, 0), t(15, 0)),
            ]
        );
    }

    #[test]
    fn overlapping_blocks_are_not_deduplicated() {
        // Two active blocks on the same day should never coexist, but if fed
        // in anyway each is tiled independently.
        let blocks = [block(t(9, 0), t(10, 0), 30), block(t(9, 0), t(10, 0), 30)];
        let slots = available_slots(monday(), blocks.iter(), &HashSet::new());
        assert_eq!(slots.len(), 4);
    }

    #[test]
    fn repeated_computation_is_identical() {
        let ds = doctor_with(
            vec![block(t(9, 0), t(12, 0), 15), block(t(13, 0), t(17, 0), 45)],
            vec![(TimeRange::new(t(9, 15), t(9, 30)), AppointmentStatus::Confirmed)],
        );
        let first = availability(&ds, monday());
        let second = availability(&ds, monday());
        assert_eq!(first, second);
        assert_eq!(first.len(), 12 - 1 + 5);
    }
}
