/// Max bytes in a guest first or last name.
pub const MAX_NAME_LEN: usize = 255;

/// Max bytes in a room number.
pub const MAX_ROOM_NUMBER_LEN: usize = 32;

/// Longest stay accepted, in nights.
pub const MAX_STAY_DAYS: i64 = 366;

/// Calendar years accepted for arrival and departure dates.
pub const MIN_VALID_YEAR: i32 = 1970;
pub const MAX_VALID_YEAR: i32 = 9999;

pub const MAX_GUESTS: usize = 1_000_000;
pub const MAX_ROOMS: usize = 100_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

/// Max bytes in a single console statement.
pub const MAX_STATEMENT_LEN: usize = 64 * 1024;
