use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Two half-open intervals overlap iff `s1 < e2 && s2 < e1`.
    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Booking lifecycle. Only `Scheduled` and `Pending` occupy theater time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Pending,
    Completed,
    Canceled,
    /// Displaced entirely by an emergency; retained for audit and reversal.
    Preempted,
}

impl BookingStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Scheduled | BookingStatus::Pending)
    }

    /// Transitions a client may request directly. `Preempted` is only ever
    /// set and cleared by the escalation paths.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Scheduled, Pending)
                | (Scheduled, Completed)
                | (Scheduled, Canceled)
                | (Pending, Scheduled)
                | (Pending, Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Pending => "pending",
            BookingStatus::Completed => "completed",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Preempted => "preempted",
        }
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(BookingStatus::Scheduled),
            "pending" => Ok(BookingStatus::Pending),
            "completed" => Ok(BookingStatus::Completed),
            "canceled" | "cancelled" => Ok(BookingStatus::Canceled),
            "preempted" => Ok(BookingStatus::Preempted),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Clinical payload. Opaque to the scheduling core — carried through
/// unchanged, copied onto emergency bookings at escalation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseInfo {
    pub patient: Option<String>,
    pub procedure: Option<String>,
}

/// A reservation of a theater for a time interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub is_emergency: bool,
    /// Back-reference from an emergency booking to the booking it preempted.
    pub overridden_booking_id: Option<Ulid>,
    pub emergency_reason: Option<String>,
    pub case: CaseInfo,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone)]
pub struct TheaterState {
    pub id: Ulid,
    pub name: Option<String>,
    /// All bookings (every status), sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl TheaterState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn get_booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Move a booking to a new span, keeping the list sorted.
    /// Returns false if the id is unknown.
    pub fn reslot_booking(&mut self, id: Ulid, span: Span) -> bool {
        match self.remove_booking(id) {
            Some(mut booking) => {
                booking.span = span;
                self.insert_booking(booking);
                true
            }
            None => false,
        }
    }

    /// Return only bookings whose span overlaps the query window, in
    /// ascending start order. Uses binary search to skip bookings starting
    /// at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TheaterCreated {
        id: Ulid,
        name: Option<String>,
    },
    TheaterUpdated {
        id: Ulid,
        name: Option<String>,
    },
    TheaterDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        theater_id: Ulid,
        span: Span,
        status: BookingStatus,
        case: CaseInfo,
    },
    BookingRescheduled {
        id: Ulid,
        theater_id: Ulid,
        span: Span,
    },
    BookingStatusChanged {
        id: Ulid,
        theater_id: Ulid,
        status: BookingStatus,
    },
    EmergencyInserted {
        id: Ulid,
        theater_id: Ulid,
        span: Span,
        overridden_booking_id: Option<Ulid>,
        reason: String,
        case: CaseInfo,
    },
    /// Reversal deletes the emergency row outright; the restore of the
    /// overridden booking rides in the same commit as a status change.
    EmergencyRemoved {
        id: Ulid,
        theater_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TheaterInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub id: Ulid,
    pub theater_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub is_emergency: bool,
    pub overridden_booking_id: Option<Ulid>,
    pub emergency_reason: Option<String>,
    pub patient: Option<String>,
    pub procedure: Option<String>,
}

impl BookingRecord {
    pub fn from_booking(theater_id: Ulid, b: &Booking) -> Self {
        Self {
            id: b.id,
            theater_id,
            start: b.span.start,
            end: b.span.end,
            status: b.status,
            is_emergency: b.is_emergency,
            overridden_booking_id: b.overridden_booking_id,
            emergency_reason: b.emergency_reason.clone(),
            patient: b.case.patient.clone(),
            procedure: b.case.procedure.clone(),
        }
    }
}

/// One colliding booking, as reported by the conflict gate so the caller
/// can offer an alternative slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub patient: Option<String>,
    pub procedure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationOutcome {
    pub emergency_id: Ulid,
    pub overridden_id: Ulid,
    /// Displaced bookings, in the order they were relocated.
    pub shifted: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReversalOutcome {
    /// None when the overridden booking no longer exists.
    pub restored_id: Option<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            span: Span::new(start, end),
            status: BookingStatus::Scheduled,
            is_emergency: false,
            overridden_booking_id: None,
            emergency_reason: None,
            case: CaseInfo::default(),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn booking_ordering() {
        let mut ts = TheaterState::new(Ulid::new(), None);
        ts.insert_booking(booking(300, 400));
        ts.insert_booking(booking(100, 200));
        ts.insert_booking(booking(200, 300));
        assert_eq!(ts.bookings[0].span.start, 100);
        assert_eq!(ts.bookings[1].span.start, 200);
        assert_eq!(ts.bookings[2].span.start, 300);
    }

    #[test]
    fn booking_remove() {
        let mut ts = TheaterState::new(Ulid::new(), None);
        let b = booking(100, 200);
        let id = b.id;
        ts.insert_booking(b);
        assert_eq!(ts.bookings.len(), 1);
        assert!(ts.remove_booking(id).is_some());
        assert!(ts.bookings.is_empty());
        assert!(ts.remove_booking(id).is_none());
    }

    #[test]
    fn reslot_keeps_order() {
        let mut ts = TheaterState::new(Ulid::new(), None);
        let a = booking(100, 200);
        let b = booking(300, 400);
        let a_id = a.id;
        ts.insert_booking(a);
        ts.insert_booking(b);

        assert!(ts.reslot_booking(a_id, Span::new(500, 600)));
        assert_eq!(ts.bookings[0].span.start, 300);
        assert_eq!(ts.bookings[1].span.start, 500);
        assert_eq!(ts.bookings[1].id, a_id);
        assert_eq!(ts.bookings[1].span.duration_ms(), 100);
    }

    #[test]
    fn reslot_unknown_id() {
        let mut ts = TheaterState::new(Ulid::new(), None);
        assert!(!ts.reslot_booking(Ulid::new(), Span::new(0, 100)));
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ts = TheaterState::new(Ulid::new(), None);
        ts.insert_booking(booking(100, 200));
        ts.insert_booking(booking(450, 600));
        ts.insert_booking(booking(1000, 1100));

        let query = Span::new(500, 800);
        let hits: Vec<_> = ts.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // A booking ending exactly at query.start is NOT overlapping (half-open)
        let mut ts = TheaterState::new(Ulid::new(), None);
        ts.insert_booking(booking(100, 200));
        let query = Span::new(200, 300);
        assert_eq!(ts.overlapping(&query).count(), 0);
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut ts = TheaterState::new(Ulid::new(), None);
        ts.insert_booking(booking(100, 201));
        let query = Span::new(200, 300);
        assert_eq!(ts.overlapping(&query).count(), 1);
    }

    #[test]
    fn overlapping_yields_ascending_start() {
        let mut ts = TheaterState::new(Ulid::new(), None);
        ts.insert_booking(booking(500, 700));
        ts.insert_booking(booking(100, 600));
        ts.insert_booking(booking(300, 400));
        let query = Span::new(0, 1000);
        let starts: Vec<Ms> = ts.overlapping(&query).map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 300, 500]);
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Scheduled.is_active());
        assert!(BookingStatus::Pending.is_active());
        assert!(!BookingStatus::Completed.is_active());
        assert!(!BookingStatus::Canceled.is_active());
        assert!(!BookingStatus::Preempted.is_active());
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Scheduled.can_transition_to(Completed));
        assert!(Scheduled.can_transition_to(Canceled));
        assert!(Pending.can_transition_to(Scheduled));
        assert!(!Scheduled.can_transition_to(Preempted)); // escalation-only
        assert!(!Completed.can_transition_to(Scheduled));
        assert!(!Canceled.can_transition_to(Scheduled));
        assert!(!Preempted.can_transition_to(Scheduled)); // reversal-only
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in ["scheduled", "pending", "completed", "canceled", "preempted"] {
            let status: BookingStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        let gb: BookingStatus = "cancelled".parse().unwrap();
        assert_eq!(gb, BookingStatus::Canceled);
        assert!("operating".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::EmergencyInserted {
            id: Ulid::new(),
            theater_id: Ulid::new(),
            span: Span::new(1000, 2000),
            overridden_booking_id: Some(Ulid::new()),
            reason: "ruptured aneurysm".into(),
            case: CaseInfo {
                patient: Some("doe, j".into()),
                procedure: Some("craniotomy".into()),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
