use ulid::Ulid;

use crate::model::{BookingStatus, ConflictInfo, Ms};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// start >= end — rejected before any state access.
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    /// A regular create/update collides with active bookings. Carries the
    /// full colliding set so the caller can offer another slot. Never
    /// retried internally.
    ConflictDetected(Vec<ConflictInfo>),
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    TheaterInUse(Ulid),
    /// Target missing, not in an escalatable status, or already escalated.
    NotEligibleForEscalation(Ulid),
    /// Reversal target missing or not an emergency booking.
    EmergencyNotFound(Ulid),
    /// The first-fit relocation probe hit its cap; the whole escalation is
    /// rolled back.
    PlacementExhausted {
        booking_id: Ulid,
        probes: usize,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: [{start}, {end})")
            }
            EngineError::ConflictDetected(conflicts) => {
                write!(f, "conflict with {} active booking(s):", conflicts.len())?;
                for c in conflicts {
                    write!(f, " {}@[{},{})", c.id, c.span.start, c.span.end)?;
                }
                Ok(())
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(
                    f,
                    "booking {id}: cannot transition from {} to {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::TheaterInUse(id) => {
                write!(f, "cannot delete theater {id}: active bookings remain")
            }
            EngineError::NotEligibleForEscalation(id) => {
                write!(f, "booking {id} is not eligible for escalation")
            }
            EngineError::EmergencyNotFound(id) => {
                write!(f, "no emergency booking: {id}")
            }
            EngineError::PlacementExhausted { booking_id, probes } => {
                write!(
                    f,
                    "no free slot for displaced booking {booking_id} within {probes} probes"
                )
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
