mod conflict;
mod error;
mod escalation;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::limits::{DEFAULT_EMERGENCY_WINDOW_MS, DEFAULT_PROBE_STEP_MS, MAX_PLACEMENT_PROBES};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTheaterState = Arc<RwLock<TheaterState>>;

/// Escalation tunables. Env-overridable in main; fixed per engine.
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    /// Length of the window an emergency seizes, from "now".
    pub window_ms: Ms,
    /// Forward step of the first-fit probe for displaced bookings.
    pub probe_step_ms: Ms,
    /// Probe cap per displaced booking before the escalation fails whole.
    pub max_probes: usize,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_EMERGENCY_WINDOW_MS,
            probe_step_ms: DEFAULT_PROBE_STEP_MS,
            max_probes: MAX_PLACEMENT_PROBES,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        /// One commit: events that must become durable together.
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches commits for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingCommit>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [PendingCommit]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<PendingCommit>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedTheaterState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub policy: EscalationPolicy,
    /// Reverse lookup: booking id → theater id
    pub(super) booking_index: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a TheaterState (no locking — caller holds the
/// lock).
fn apply_to_theater(ts: &mut TheaterState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            theater_id,
            span,
            status,
            case,
        } => {
            ts.insert_booking(Booking {
                id: *id,
                span: *span,
                status: *status,
                is_emergency: false,
                overridden_booking_id: None,
                emergency_reason: None,
                case: case.clone(),
            });
            booking_index.insert(*id, *theater_id);
        }
        Event::BookingRescheduled { id, span, .. } => {
            ts.reslot_booking(*id, *span);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = ts.get_booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::EmergencyInserted {
            id,
            theater_id,
            span,
            overridden_booking_id,
            reason,
            case,
        } => {
            ts.insert_booking(Booking {
                id: *id,
                span: *span,
                status: BookingStatus::Scheduled,
                is_emergency: true,
                overridden_booking_id: *overridden_booking_id,
                emergency_reason: Some(reason.clone()),
                case: case.clone(),
            });
            booking_index.insert(*id, *theater_id);
        }
        Event::EmergencyRemoved { id, .. } => {
            ts.remove_booking(*id);
            booking_index.remove(id);
        }
        Event::TheaterUpdated { name, .. } => {
            ts.name = name.clone();
        }
        // TheaterCreated/Deleted are handled at the DashMap level, not here
        Event::TheaterCreated { .. } | Event::TheaterDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        policy: EscalationPolicy,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            policy,
            booking_index: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::TheaterCreated { id, name } => {
                    let ts = TheaterState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(ts)));
                }
                Event::TheaterDeleted { id } => {
                    if let Some((_, ts)) = engine.state.remove(id) {
                        let guard = ts.try_read().expect("replay: uncontended read");
                        for b in &guard.bookings {
                            engine.booking_index.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(theater_id) = event_theater_id(other)
                        && let Some(entry) = engine.state.get(&theater_id) {
                            let ts_arc = entry.clone();
                            let mut guard = ts_arc.try_write().expect("replay: uncontended write");
                            apply_to_theater(&mut guard, other, &engine.booking_index);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write one commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_theater(&self, id: &Ulid) -> Option<SharedTheaterState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_theater_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append one commit + apply each event + notify. The commit hits
    /// the WAL before any in-memory mutation, so a failed append leaves the
    /// theater exactly as it was.
    pub(super) async fn persist_and_apply(
        &self,
        theater_id: Ulid,
        ts: &mut TheaterState,
        events: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append(events).await?;
        for event in events {
            apply_to_theater(ts, event, &self.booking_index);
            self.notify.send(theater_id, event);
        }
        Ok(())
    }

    /// Lookup booking → theater, get theater, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<TheaterState>), EngineError> {
        let theater_id = self
            .get_theater_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ts = self
            .get_theater(&theater_id)
            .ok_or(EngineError::NotFound(theater_id))?;
        let guard = ts.write_owned().await;
        Ok((theater_id, guard))
    }
}

/// Extract the theater_id from an event (for non-Create/Delete events).
fn event_theater_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { theater_id, .. }
        | Event::BookingRescheduled { theater_id, .. }
        | Event::BookingStatusChanged { theater_id, .. }
        | Event::EmergencyInserted { theater_id, .. }
        | Event::EmergencyRemoved { theater_id, .. } => Some(*theater_id),
        Event::TheaterUpdated { id, .. } => Some(*id),
        Event::TheaterCreated { .. } | Event::TheaterDeleted { .. } => None,
    }
}
