use ulid::Ulid;

use crate::limits::{MAX_REASON_LEN, MAX_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::conflict::{checked_span, find_conflicts, now_ms};
use super::{Engine, EngineError};

impl Engine {
    /// Seize a theater for an emergency case.
    ///
    /// Preempts `booking_id`, pushes every other active booking that
    /// overlaps the emergency window forward to the next free slot in the
    /// same theater, and inserts the emergency booking with a back-reference
    /// to the preempted one. The whole sequence is planned against a scratch
    /// copy under the theater's write lock and persisted as a single WAL
    /// commit: it either happens entirely or not at all.
    pub async fn escalate(
        &self,
        emergency_id: Ulid,
        booking_id: Ulid,
        reason: &str,
    ) -> Result<EscalationOutcome, EngineError> {
        self.escalate_at(emergency_id, booking_id, reason, now_ms()).await
    }

    /// `escalate` with an explicit clock, the deterministic entry point.
    pub async fn escalate_at(
        &self,
        emergency_id: Ulid,
        booking_id: Ulid,
        reason: &str,
        now: Ms,
    ) -> Result<EscalationOutcome, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::LimitExceeded("emergency reason required"));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("emergency reason too long"));
        }
        if self.booking_index.contains_key(&emergency_id) {
            return Err(EngineError::AlreadyExists(emergency_id));
        }

        // The write lock is the theater-level mutual exclusion: concurrent
        // escalations on one theater serialize here, so no two can compute
        // placements from the same snapshot.
        let (theater_id, mut guard) = self
            .resolve_booking_write(&booking_id)
            .await
            .map_err(|_| EngineError::NotEligibleForEscalation(booking_id))?;

        let target = guard
            .get_booking(booking_id)
            .ok_or(EngineError::NotEligibleForEscalation(booking_id))?;
        if !target.is_active() || target.is_emergency {
            return Err(EngineError::NotEligibleForEscalation(booking_id));
        }
        // No double-escalation: a live emergency already referencing the
        // target blocks another one.
        if guard
            .bookings
            .iter()
            .any(|b| b.is_emergency && b.overridden_booking_id == Some(booking_id))
        {
            return Err(EngineError::NotEligibleForEscalation(booking_id));
        }
        let case = target.case.clone();

        let window = checked_span(now, now + self.policy.window_ms)?;

        // Plan on a scratch copy so every probe sees earlier relocations of
        // this pass (read-your-own-writes) and a failure leaves the live
        // state untouched.
        let mut scratch = guard.clone();
        let mut events = Vec::new();

        if let Some(b) = scratch.get_booking_mut(booking_id) {
            b.status = BookingStatus::Preempted;
        }
        events.push(Event::BookingStatusChanged {
            id: booking_id,
            theater_id,
            status: BookingStatus::Preempted,
        });

        // Displaced set: every remaining active booking overlapping the
        // window, earliest first. Processing order decides who gets which
        // slot when several compete; ascending start keeps it stable.
        let displaced = find_conflicts(&scratch, &window, None);

        // Vacate the whole cohort up front: a booking awaiting relocation in
        // this pass does not block an earlier one, and each relocation
        // becomes a blocker for the next probe the moment it lands.
        let cohort: Vec<Booking> = displaced
            .iter()
            .filter_map(|d| scratch.remove_booking(d.id))
            .collect();

        let mut shifted = Vec::with_capacity(cohort.len());
        for mut booking in cohort {
            let slot =
                self.first_fit(&scratch, booking.id, booking.span.duration_ms(), window.end)?;
            events.push(Event::BookingRescheduled {
                id: booking.id,
                theater_id,
                span: slot,
            });
            shifted.push(booking.id);
            booking.span = slot;
            scratch.insert_booking(booking);
        }

        events.push(Event::EmergencyInserted {
            id: emergency_id,
            theater_id,
            span: window,
            overridden_booking_id: Some(booking_id),
            reason: reason.to_string(),
            case,
        });

        self.persist_and_apply(theater_id, &mut guard, &events).await?;

        tracing::info!(
            "escalated booking {booking_id} in theater {theater_id}: emergency {emergency_id}, {} shifted",
            shifted.len()
        );
        metrics::counter!(crate::observability::ESCALATIONS_TOTAL).increment(1);
        metrics::counter!(crate::observability::BOOKINGS_SHIFTED_TOTAL)
            .increment(shifted.len() as u64);

        Ok(EscalationOutcome {
            emergency_id,
            overridden_id: booking_id,
            shifted,
        })
    }

    /// First-fit placement: try immediately after the blocking window, and
    /// on conflict advance by the probe step. Bounded — a schedule dense
    /// enough to exhaust the cap fails the escalation instead of spinning.
    /// The booking being placed is already vacated from `scratch`.
    fn first_fit(
        &self,
        scratch: &TheaterState,
        booking_id: Ulid,
        duration: Ms,
        from: Ms,
    ) -> Result<Span, EngineError> {
        let mut candidate_start = from;
        for probe in 0..self.policy.max_probes {
            if candidate_start + duration > MAX_VALID_TIMESTAMP_MS {
                return Err(EngineError::PlacementExhausted { booking_id, probes: probe });
            }
            let candidate = Span::new(candidate_start, candidate_start + duration);
            if find_conflicts(scratch, &candidate, None).is_empty() {
                return Ok(candidate);
            }
            candidate_start += self.policy.probe_step_ms;
        }
        Err(EngineError::PlacementExhausted {
            booking_id,
            probes: self.policy.max_probes,
        })
    }

    /// Undo an escalation: restore the preempted booking to `Scheduled` and
    /// delete the emergency row. Shifted bookings stay at their shifted
    /// times — moving them back could reintroduce conflicts, so reversal is
    /// deliberately asymmetric. The restored slot is not re-validated.
    pub async fn cancel_escalation(
        &self,
        emergency_id: Ulid,
    ) -> Result<ReversalOutcome, EngineError> {
        let (theater_id, mut guard) = self
            .resolve_booking_write(&emergency_id)
            .await
            .map_err(|_| EngineError::EmergencyNotFound(emergency_id))?;

        let emergency = guard
            .get_booking(emergency_id)
            .ok_or(EngineError::EmergencyNotFound(emergency_id))?;
        if !emergency.is_emergency {
            return Err(EngineError::EmergencyNotFound(emergency_id));
        }

        // Restore only if the overridden booking still exists; a vanished
        // predecessor just means nothing to restore.
        let restored_id = emergency
            .overridden_booking_id
            .filter(|orig| guard.get_booking(*orig).is_some());

        let mut events = Vec::new();
        if let Some(orig) = restored_id {
            events.push(Event::BookingStatusChanged {
                id: orig,
                theater_id,
                status: BookingStatus::Scheduled,
            });
        }
        events.push(Event::EmergencyRemoved {
            id: emergency_id,
            theater_id,
        });

        self.persist_and_apply(theater_id, &mut guard, &events).await?;

        tracing::info!(
            "cancelled escalation {emergency_id} in theater {theater_id}, restored {restored_id:?}"
        );
        metrics::counter!(crate::observability::ESCALATION_REVERSALS_TOTAL).increment(1);

        Ok(ReversalOutcome { restored_id })
    }
}
