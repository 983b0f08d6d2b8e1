//! Misfire bookkeeping
//!
//! A trigger that fires while the previous run of the same items is still
//! going leaves a `sharding/<item>/misfire` marker instead of running. After
//! the current run finishes the marked items run exactly once more and the
//! markers are cleared; there is no catch-up loop.

use tracing::info;

use super::config::ConfigurationService;
use super::execution::ExecutionService;
use crate::error::Result;
use crate::metrics;
use crate::node::{ItemNode, JobNodeStorage};

/// Records and resolves misfired triggers
#[derive(Clone)]
pub struct MisfireService {
    storage: JobNodeStorage,
    config: ConfigurationService,
    execution: ExecutionService,
}

impl MisfireService {
    pub fn new(
        storage: JobNodeStorage,
        config: ConfigurationService,
        execution: ExecutionService,
    ) -> Self {
        Self {
            storage,
            config,
            execution,
        }
    }

    /// If any of `items` is still running, record misfires and report `true`
    /// so the caller skips this trigger.
    pub async fn misfire_if_running(&self, items: &[u32]) -> Result<bool> {
        if !self.execution.has_running_items(items).await? {
            return Ok(false);
        }
        if self.config.load(true).await?.misfire {
            self.set_misfire(items).await?;
        }
        Ok(true)
    }

    pub async fn set_misfire(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .create_job_node_if_needed(&self.storage.path().item_node(item, ItemNode::Misfire))
                .await?;
        }
        metrics::record_misfires(self.storage.job_name(), items.len());
        info!(job = %self.storage.job_name(), items = ?items, "Trigger misfired, items still running");
        Ok(())
    }

    /// Subset of `items` carrying a misfire marker
    pub async fn get_misfired_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut misfired = Vec::new();
        for &item in items {
            let marker = self.storage.path().item_node(item, ItemNode::Misfire);
            if self.storage.is_job_node_existed(&marker).await? {
                misfired.push(item);
            }
        }
        Ok(misfired)
    }

    /// Whether a catch-up run of `items` is due
    pub async fn is_execute_misfired(&self, items: &[u32]) -> Result<bool> {
        Ok(self.config.load(true).await?.misfire && !self.get_misfired_items(items).await?.is_empty())
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .remove_job_node_if_existed(&self.storage.path().item_node(item, ItemNode::Misfire))
                .await?;
        }
        Ok(())
    }

    /// Remove every misfire marker of the job (misfire turned off)
    pub async fn clear_all_misfire(&self) -> Result<()> {
        let items = self.storage.get_sharding_item_keys().await?;
        self.clear_misfire(&items).await
    }
}
