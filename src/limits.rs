pub const MAX_DOCTORS: usize = 10_000;
pub const MAX_SCHEDULES_PER_DOCTOR: usize = 512;
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 100_000;

/// A tile can be at most one whole day.
pub const MAX_INTERVAL_MINUTES: u32 = 24 * 60;

pub const MAX_SPECIALTY_LEN: usize = 120;
pub const MAX_REASON_LEN: usize = 255;
pub const MAX_TOKEN_LEN: usize = 64;
