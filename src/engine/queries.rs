use ulid::Ulid;

use crate::model::*;

use super::conflict::{checked_span, find_conflicts};
use super::{Engine, EngineError};

impl Engine {
    /// The conflict primitive, exposed read-only: every active booking in
    /// the theater overlapping `[start, end)`, ascending by start. Empty
    /// result means the slot is free. Used by clients before committing to
    /// a slot; the authoritative gate runs again inside the write path.
    pub async fn check_conflict(
        &self,
        theater_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ConflictInfo>, EngineError> {
        let span = checked_span(start, end)?;
        let ts = self
            .get_theater(&theater_id)
            .ok_or(EngineError::NotFound(theater_id))?;
        let guard = ts.read().await;
        Ok(find_conflicts(&guard, &span, exclude))
    }

    pub fn list_theaters(&self) -> Vec<TheaterInfo> {
        self.state
            .iter()
            .map(|entry| {
                let ts = entry.value().clone();
                let guard = ts.try_read().expect("list_theaters: uncontended read");
                TheaterInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                }
            })
            .collect()
    }

    /// All bookings of a theater, every status — retired rows included.
    pub async fn get_bookings(&self, theater_id: Ulid) -> Result<Vec<BookingRecord>, EngineError> {
        let ts = match self.get_theater(&theater_id) {
            Some(ts) => ts,
            None => return Ok(vec![]),
        };
        let guard = ts.read().await;
        Ok(guard
            .bookings
            .iter()
            .map(|b| BookingRecord::from_booking(theater_id, b))
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingRecord, EngineError> {
        let theater_id = self
            .get_theater_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ts = self
            .get_theater(&theater_id)
            .ok_or(EngineError::NotFound(theater_id))?;
        let guard = ts.read().await;
        let booking = guard.get_booking(id).ok_or(EngineError::NotFound(id))?;
        Ok(BookingRecord::from_booking(theater_id, booking))
    }

    /// Scheduled bookings whose interval has fully elapsed — the sweeper
    /// marks these completed.
    pub fn collect_elapsed(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut elapsed = Vec::new();
        for entry in self.state.iter() {
            let ts = entry.value().clone();
            if let Ok(guard) = ts.try_read() {
                for b in &guard.bookings {
                    if b.status == BookingStatus::Scheduled && !b.is_emergency && b.span.end <= now
                    {
                        elapsed.push((b.id, guard.id));
                    }
                }
            }
        }
        elapsed
    }
}
