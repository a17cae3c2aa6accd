use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that marks elapsed scheduled bookings completed.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let elapsed = engine.collect_elapsed(now);
        for (booking_id, _theater_id) in elapsed {
            match engine
                .set_booking_status(booking_id, crate::model::BookingStatus::Completed)
                .await
            {
                Ok(_) => info!("completed elapsed booking {booking_id}"),
                Err(e) => {
                    // May have been mutated concurrently — that's fine
                    tracing::debug!("sweeper skip {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough commits accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} commits"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
