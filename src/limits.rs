use crate::model::{Amount, Ms};

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_WINDOWS_PER_PROVIDER: usize = 512;
pub const MAX_ENTRIES_PER_WINDOW: usize = 400;
pub const MAX_SURCHARGE_RULES: usize = 256;

/// Upper bound for base prices and surcharge amounts.
pub const MAX_AMOUNT: Amount = 1_000_000_000;

/// Longest hold a caller may request (one hour).
pub const MAX_HOLD_TTL_MS: Ms = 3_600_000;

/// Smallest allowed grid step.
pub const MIN_GRID_STEP_MINUTES: u32 = 5;
