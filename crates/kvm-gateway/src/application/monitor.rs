//! Periodic re-probing of every registered unit.
//!
//! The monitor runs as one tokio task.  Every `interval` it refreshes the
//! registry (all units probed concurrently) and publishes one
//! `device_status` event per unit on the device event bus.  It stops when
//! the shutdown signal flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::gateway::Gateway;

pub struct StatusMonitor {
    gateway: Arc<Gateway>,
    interval: Duration,
}

impl StatusMonitor {
    pub fn new(gateway: Arc<Gateway>, interval: Duration) -> Self {
        Self { gateway, interval }
    }

    /// Probes every unit once and publishes the results.  Returns how many
    /// units were probed.
    pub async fn run_once(&self) -> usize {
        let reports = self.gateway.registry.refresh_all().await;
        let count = reports.len();
        for report in reports {
            self.gateway.publish_status(report).await;
        }
        debug!("status pass over {count} device(s)");
        count
    }

    /// Spawns the monitor loop.  The first pass runs one `interval` after
    /// start, since registration has just probed every unit.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("status monitor running every {:?}", self.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("status monitor stopped");
        })
    }
}
