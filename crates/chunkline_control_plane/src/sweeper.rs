use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::coordinator::UploadCoordinator;

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub max_age: Duration,
}

pub fn spawn_orphan_sweeper(
    coordinator: Arc<UploadCoordinator>,
    config: SweeperConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match coordinator.cleanup_orphans(config.max_age).await {
                Ok(0) => {}
                Ok(reclaimed) => info!(reclaimed, "orphan sweep finished"),
                Err(err) => warn!(error = %err, "orphan sweep failed"),
            }
        }
    })
}
