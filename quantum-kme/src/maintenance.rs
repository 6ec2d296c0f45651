//! Background pool maintenance.

use crate::service::KeyService;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run `KeyService::maintain` every `maintenance_interval` until the task is aborted.
///
/// The first sweep runs immediately. A failed sweep is logged and the next
/// tick tries again.
pub fn spawn_maintenance(service: Arc<KeyService>) -> JoinHandle<()> {
    let period = service.maintenance_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = service.maintain() {
                tracing::warn!(error = %e, "pool maintenance failed; retrying next tick");
            }
        }
    })
}
