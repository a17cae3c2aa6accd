use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, checked_span};
use super::{Engine, EngineError, WalCommand};

fn validate_case(case: &CaseInfo) -> Result<(), EngineError> {
    if let Some(ref p) = case.patient
        && p.len() > MAX_CASE_FIELD_LEN {
            return Err(EngineError::LimitExceeded("patient field too long"));
        }
    if let Some(ref p) = case.procedure
        && p.len() > MAX_CASE_FIELD_LEN {
            return Err(EngineError::LimitExceeded("procedure field too long"));
        }
    Ok(())
}

impl Engine {
    pub async fn create_theater(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_THEATERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many theaters"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("theater name too long"));
            }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::TheaterCreated { id, name: name.clone() };
        self.wal_append(std::slice::from_ref(&event)).await?;
        let ts = TheaterState::new(id, name);
        self.state.insert(id, Arc::new(RwLock::new(ts)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_theater(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("theater name too long"));
            }
        let ts = self.get_theater(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ts.write().await;

        let event = Event::TheaterUpdated { id, name };
        self.persist_and_apply(id, &mut guard, std::slice::from_ref(&event))
            .await
    }

    /// Delete a theater. Refused while active bookings remain — retired
    /// bookings (completed/canceled/preempted audit rows) go with it.
    pub async fn delete_theater(&self, id: Ulid) -> Result<(), EngineError> {
        let ts = self.get_theater(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ts.read().await;
        if guard.bookings.iter().any(|b| b.is_active()) {
            return Err(EngineError::TheaterInUse(id));
        }
        let retired: Vec<Ulid> = guard.bookings.iter().map(|b| b.id).collect();
        drop(guard);

        let event = Event::TheaterDeleted { id };
        self.wal_append(std::slice::from_ref(&event)).await?;
        self.state.remove(&id);
        for bid in retired {
            self.booking_index.remove(&bid);
        }
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Create a regular booking. The conflict gate runs under the theater's
    /// write lock, in the same critical section as the write it guards — no
    /// check-then-act window.
    pub async fn create_booking(
        &self,
        id: Ulid,
        theater_id: Ulid,
        start: Ms,
        end: Ms,
        case: CaseInfo,
    ) -> Result<(), EngineError> {
        let span = checked_span(start, end)?;
        validate_case(&case)?;
        if self.booking_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let ts = self
            .get_theater(&theater_id)
            .ok_or(EngineError::NotFound(theater_id))?;
        let mut guard = ts.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_THEATER {
            return Err(EngineError::LimitExceeded("too many bookings on theater"));
        }

        check_no_conflict(&guard, &span, None)?;

        let event = Event::BookingCreated {
            id,
            theater_id,
            span,
            status: BookingStatus::Scheduled,
            case,
        };
        self.persist_and_apply(theater_id, &mut guard, std::slice::from_ref(&event))
            .await
    }

    /// Atomically create multiple bookings. All-or-nothing: if any booking
    /// conflicts, none are committed. Bookings may span different theaters.
    pub async fn batch_create_bookings(
        &self,
        bookings: Vec<(Ulid, Ulid, Ms, Ms, CaseInfo)>,
    ) -> Result<(), EngineError> {
        if bookings.is_empty() {
            return Ok(());
        }
        if bookings.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut spans = Vec::with_capacity(bookings.len());
        for (id, _, start, end, case) in &bookings {
            spans.push(checked_span(*start, *end)?);
            validate_case(case)?;
            if self.booking_index.contains_key(id) {
                return Err(EngineError::AlreadyExists(*id));
            }
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut theater_ids: Vec<Ulid> = bookings.iter().map(|(_, tid, _, _, _)| *tid).collect();
        theater_ids.sort();
        theater_ids.dedup();

        let mut guards = Vec::with_capacity(theater_ids.len());
        let mut guard_idx = HashMap::new();

        for tid in &theater_ids {
            let ts = self.get_theater(tid).ok_or(EngineError::NotFound(*tid))?;
            let guard = ts.write_owned().await;
            if guard.bookings.len() + bookings.len() > MAX_BOOKINGS_PER_THEATER {
                return Err(EngineError::LimitExceeded("too many bookings on theater"));
            }
            guard_idx.insert(*tid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate every booking against current state + intra-batch.
        let mut by_theater: HashMap<Ulid, Vec<(Ulid, Span)>> = HashMap::new();
        for ((id, tid, _, _, _), span) in bookings.iter().zip(&spans) {
            by_theater.entry(*tid).or_default().push((*id, *span));
        }

        for (tid, batch) in &by_theater {
            let guard = &guards[guard_idx[tid]];
            for (_, span) in batch {
                check_no_conflict(guard, span, None)?;
            }
            for i in 0..batch.len() {
                for j in (i + 1)..batch.len() {
                    if batch[i].1.overlaps(&batch[j].1) {
                        return Err(EngineError::ConflictDetected(vec![ConflictInfo {
                            id: batch[i].0,
                            span: batch[i].1,
                            status: BookingStatus::Scheduled,
                            patient: None,
                            procedure: None,
                        }]));
                    }
                }
            }
        }

        // Phase 2: all validated — commit. One WAL commit per theater keeps
        // each theater's batch crash-atomic.
        for (tid, _) in &by_theater {
            let events: Vec<Event> = bookings
                .iter()
                .zip(&spans)
                .filter(|((_, btid, _, _, _), _)| btid == tid)
                .map(|((id, _, _, _, case), span)| Event::BookingCreated {
                    id: *id,
                    theater_id: *tid,
                    span: *span,
                    status: BookingStatus::Scheduled,
                    case: case.clone(),
                })
                .collect();
            let idx = guard_idx[tid];
            self.persist_and_apply(*tid, &mut guards[idx], &events).await?;
        }

        Ok(())
    }

    /// Reschedule a booking to a new interval, gated against every other
    /// active booking in its theater.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Ulid, EngineError> {
        let span = checked_span(start, end)?;
        let (theater_id, mut guard) = self.resolve_booking_write(&id).await?;

        let booking = guard.get_booking(id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_active() {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                to: booking.status,
            });
        }

        check_no_conflict(&guard, &span, Some(id))?;

        let event = Event::BookingRescheduled { id, theater_id, span };
        self.persist_and_apply(theater_id, &mut guard, std::slice::from_ref(&event))
            .await?;
        Ok(theater_id)
    }

    /// Client-driven status transition, validated against the lifecycle.
    /// `Preempted` can be neither entered nor left this way.
    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Ulid, EngineError> {
        let (theater_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.get_booking(id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                to: status,
            });
        }

        let event = Event::BookingStatusChanged { id, theater_id, status };
        self.persist_and_apply(theater_id, &mut guard, std::slice::from_ref(&event))
            .await?;
        Ok(theater_id)
    }

    /// Cancel a booking. The row is retained (status change, not deletion).
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.set_booking_status(id, BookingStatus::Canceled).await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let theater_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in theater_ids {
            let entry = match self.state.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let ts = entry.value().clone();
            let guard = ts.try_read().expect("compact: uncontended read");

            events.push(Event::TheaterCreated {
                id: guard.id,
                name: guard.name.clone(),
            });

            for b in &guard.bookings {
                if b.is_emergency {
                    events.push(Event::EmergencyInserted {
                        id: b.id,
                        theater_id: guard.id,
                        span: b.span,
                        overridden_booking_id: b.overridden_booking_id,
                        reason: b.emergency_reason.clone().unwrap_or_default(),
                        case: b.case.clone(),
                    });
                    if b.status != BookingStatus::Scheduled {
                        events.push(Event::BookingStatusChanged {
                            id: b.id,
                            theater_id: guard.id,
                            status: b.status,
                        });
                    }
                } else {
                    events.push(Event::BookingCreated {
                        id: b.id,
                        theater_id: guard.id,
                        span: b.span,
                        status: b.status,
                        case: b.case.clone(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
