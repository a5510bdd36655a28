use crate::model::{Minor, Ms};

// Tenants
pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

// Master data
pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_LOCATIONS_PER_SERVICE: usize = 64;
pub const MAX_WINDOWS_PER_SERVICE: usize = 1_024;
pub const MAX_ADDONS_PER_SERVICE: usize = 128;
pub const MAX_PACKAGE_ITEMS: usize = 32;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_DURATION_MIN: u32 = 24 * 60;
pub const MAX_ADDON_QUANTITY: u32 = 100;
pub const MAX_PACKAGE_ITEM_QUANTITY: u32 = 100;
/// Upper bound on any single price, charge or modifier, in minor units.
pub const MAX_PRICE_MINOR: Minor = 1_000_000_000_000;

// Bookings
pub const MAX_BOOKINGS_PER_SERVICE: usize = 100_000;
pub const MAX_ADDONS_PER_BOOKING: usize = 32;
pub const MAX_SLOT_QUERY_DAYS: i64 = 93;
pub const MIN_SLOT_STEP_MIN: u32 = 5;

// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
