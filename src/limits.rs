//! Hard caps. Every externally supplied quantity is bounded before it can
//! touch engine state; violations surface as `EngineError::LimitExceeded`.

use crate::model::Ms;

/// Earliest accepted timestamp (1970-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest accepted timestamp (2100-01-01).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest single booking: one week. Also bounds conflict-query windows,
/// which are candidate booking slots.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_THEATERS_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_THEATER: usize = 100_000;
pub const MAX_BATCH_SIZE: usize = 500;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_CASE_FIELD_LEN: usize = 512;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Default emergency window seized by an escalation.
pub const DEFAULT_EMERGENCY_WINDOW_MS: Ms = 3_600_000;

/// Default forward step of the first-fit relocation probe.
pub const DEFAULT_PROBE_STEP_MS: Ms = 1_800_000;

/// Upper bound on relocation probes per displaced booking. A schedule dense
/// enough to exhaust this fails the escalation instead of spinning.
pub const MAX_PLACEMENT_PROBES: usize = 1_000;
