//! Hard caps that keep a single tenant from exhausting memory or the WAL.

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_CONFIGS_PER_TENANT: usize = 100_000;
pub const MAX_OVERRIDES_PER_CONFIG: usize = 3_660;

/// Upper bound on `total_slots` for any config or override.
pub const MAX_SLOTS_PER_DAY: u32 = 1_000;
/// Bookings retained per (provider, date), terminal ones included.
pub const MAX_BOOKINGS_PER_DAY: usize = 10_000;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NOTE_LEN: usize = 1_024;
pub const MAX_REASON_LEN: usize = 1_024;
