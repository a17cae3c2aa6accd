use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Validate raw bounds and build a `Span`. `start >= end` is rejected here,
/// before any state is touched.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

/// All active bookings in the theater whose interval overlaps `span`,
/// excluding `exclude` (a booking checked against others during its own
/// update). Ascending `start` order — escalation processes earliest
/// conflicts first and depends on it. Pure: no side effects, safe to call
/// repeatedly while planning.
pub(crate) fn find_conflicts(
    ts: &TheaterState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Vec<ConflictInfo> {
    ts.overlapping(span)
        .filter(|b| b.is_active())
        .filter(|b| Some(b.id) != exclude)
        .map(|b| ConflictInfo {
            id: b.id,
            span: b.span,
            status: b.status,
            patient: b.case.patient.clone(),
            procedure: b.case.procedure.clone(),
        })
        .collect()
}

/// Gate for ordinary writes: any collision aborts the write whole.
pub(crate) fn check_no_conflict(
    ts: &TheaterState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicts = find_conflicts(ts, span, exclude);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::ConflictDetected(conflicts))
    }
}
