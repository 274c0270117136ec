use crate::model::Ms;

/// Timestamps must land in [1970-01-01, ~year 3000) — anything else is a
/// client bug or a parse artifact, not a real moving date.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 32_503_680_000_000;

pub const MAX_ROOM_NUMBER_LEN: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 2_000;
pub const MAX_ADMIN_ID_LEN: usize = 128;

pub const MAX_ROOM_CAPACITY: u32 = 1_000;
pub const MAX_ROOMS_PER_SITE: usize = 10_000;
pub const MAX_TENANTS_PER_SITE: usize = 100_000;

/// Feed paging.
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 500;
pub const MAX_TEXT_FILTER_LEN: usize = 256;

/// Site = database name on the wire; doubles as the WAL file stem.
pub const MAX_SITE_NAME_LEN: usize = 256;
pub const MAX_SITES: usize = 256;
