use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_URL_LEN: usize = 2_048;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single set never runs longer than a day.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * 3_600_000;

pub const MAX_SLOTS_PER_RESOURCE: usize = 10_000;
pub const MAX_RESOURCES: usize = 100_000;

/// Attempts to pin a booking that keeps moving under a concurrent update.
pub const MAX_UPDATE_RETRIES: usize = 8;
