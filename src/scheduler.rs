//! Background sync tick over every connected user

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::engine::Engine;

/// Users synced and users that failed during one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub synced: usize,
    pub failed: usize,
}

/// Sync every user whose connection is not waiting on re-consent.
///
/// A failing user is logged and the tick moves on.
pub async fn run_tick(engine: &Engine) -> TickSummary {
    let users = match engine.db().read(|store| store.list_active_users()) {
        Ok(users) => users,
        Err(err) => {
            tracing::error!(error = %err, "Could not list users for scheduled sync");
            return TickSummary::default();
        }
    };

    let mut summary = TickSummary::default();
    for user_id in users {
        match engine.sync_user(user_id).await {
            Ok(report) => {
                summary.synced += 1;
                tracing::debug!(
                    user_id,
                    calendars = report.calendars.len(),
                    failed = report.failed(),
                    "Scheduled sync finished"
                );
            }
            Err(err) => {
                summary.failed += 1;
                tracing::error!(user_id, error = %err, "Scheduled sync failed");
            }
        }
    }
    summary
}

/// Start the periodic tick; `None` when the interval is zero
pub fn spawn(
    engine: Arc<Engine>,
    interval_secs: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        tracing::info!("Scheduled sync disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs, "Scheduled sync started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Scheduled sync stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = run_tick(&engine).await;
                    tracing::info!(
                        synced = summary.synced,
                        failed = summary.failed,
                        "Sync tick done"
                    );
                }
            }
        }
    }))
}
