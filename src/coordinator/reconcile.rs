//! Periodic repair of stale assignments
//!
//! Events can be lost (listener lag, a session bounce) and leave items
//! assigned to instances that are gone. Every `reconcile_interval_minutes`
//! the leader checks for such items and sets the resharding flag.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::leader::LeaderService;
use super::sharding::ShardingService;
use crate::error::Result;

/// Detects assignments to offline instances
#[derive(Clone)]
pub struct ReconcileService {
    sharding: ShardingService,
    leader: LeaderService,
}

impl ReconcileService {
    pub fn new(sharding: ShardingService, leader: LeaderService) -> Self {
        Self { sharding, leader }
    }

    /// One check. Returns whether the resharding flag was set.
    pub async fn reconcile_once(&self) -> Result<bool> {
        if !self.leader.is_leader().await? || self.sharding.is_need_sharding().await? {
            return Ok(false);
        }
        if self.sharding.has_sharding_info_in_offline_servers().await? {
            info!("Assignments reference offline instances, requesting resharding");
            self.sharding.set_resharding_flag().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Run checks every `interval` until `shutdown` turns true
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "Reconcile check failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
