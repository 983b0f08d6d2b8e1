//! Failover of items whose owner crashed mid-execution
//!
//! # Lifecycle of an item
//!
//! ```text
//! RUNNING (owner A) --A crashes--> queued at /<job>/failover/<job>/<item>
//!     --claimed by B--> sharding/<item>/failover = B --B completes--> removed
//! ```
//!
//! Claiming reads the queue and then deletes the record. The two steps are
//! not atomic, so two instances may both claim an item and execute it twice.
//! That duplicate is tolerated. With `claim_token` enabled an instance first
//! writes a unique token into the record and only proceeds if it reads its
//! own token back, which narrows the window without closing it.

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::ConfigurationService;
use crate::error::Result;
use crate::metrics;
use crate::models::JobInstance;
use crate::node::{ItemNode, JobNodeStorage};
use crate::registry::RegistryError;

/// Queues, claims and completes failover executions
#[derive(Clone)]
pub struct FailoverService {
    storage: JobNodeStorage,
    config: ConfigurationService,
    instance: JobInstance,
    claim_token: bool,
}

impl FailoverService {
    pub fn new(
        storage: JobNodeStorage,
        config: ConfigurationService,
        instance: JobInstance,
        claim_token: bool,
    ) -> Self {
        Self {
            storage,
            config,
            instance,
            claim_token,
        }
    }

    /// Queue a crashed item unless failover is off or the item is already claimed
    pub async fn set_crashed_failover_flag(&self, item: u32) -> Result<bool> {
        if !self.config.load(true).await?.failover {
            return Ok(false);
        }
        let path = self.storage.path();
        if self
            .storage
            .is_job_node_existed(&path.item_node(item, ItemNode::Failover))
            .await?
        {
            return Ok(false);
        }
        let record = path.failover_record_node(item);
        if self.storage.is_job_node_existed(&record).await? {
            return Ok(false);
        }
        self.storage.fill_job_node(&record, "").await?;
        metrics::record_failover_queued(self.storage.job_name());
        info!(job = %self.storage.job_name(), item, "Queued crashed item for failover");
        Ok(true)
    }

    /// Put an item claimed by a crashed instance back into the queue
    pub async fn requeue_claimed_item(&self, item: u32) -> Result<bool> {
        let claim = self.storage.path().item_node(item, ItemNode::Failover);
        self.storage.remove_job_node_if_existed(&claim).await?;
        self.set_crashed_failover_flag(item).await
    }

    /// Queued item numbers, ascending
    pub async fn get_queued_items(&self) -> Result<Vec<u32>> {
        let mut items: Vec<u32> = self
            .storage
            .get_job_node_children_keys(&self.storage.path().failover_queue_node())
            .await?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        items.sort_unstable();
        Ok(items)
    }

    /// Claim the lowest queued item that nobody is executing.
    ///
    /// Nothing is claimed while failover is off or while the local instance
    /// still runs items of its own. Returns the claimed items (at most one).
    pub async fn failover_if_necessary(&self) -> Result<Vec<u32>> {
        let config = self.config.load(true).await?;
        if !config.failover {
            return Ok(Vec::new());
        }
        let queued = self.get_queued_items().await?;
        if queued.is_empty() || self.is_locally_running().await? {
            return Ok(Vec::new());
        }

        for item in queued {
            let running = self.storage.path().item_node(item, ItemNode::Running);
            if self.storage.is_job_node_existed(&running).await? {
                debug!(job = %self.storage.job_name(), item, "Failover item still running, skipped");
                continue;
            }
            if self.claim(item).await? {
                metrics::record_failover_claimed(self.storage.job_name(), 1);
                info!(
                    job = %self.storage.job_name(),
                    instance = %self.instance,
                    item,
                    "Claimed failover item"
                );
                return Ok(vec![item]);
            }
        }
        Ok(Vec::new())
    }

    async fn claim(&self, item: u32) -> Result<bool> {
        let record = self.storage.path().failover_record_node(item);
        if self.claim_token {
            let token = format!("{}/{}", self.instance.id(), Uuid::new_v4());
            match self.storage.update_job_node(&record, &token).await {
                Ok(()) => {}
                // Another instance already claimed and removed the record
                Err(RegistryError::NoNode(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            let current = self.storage.get_job_node_data_directly(&record).await?;
            if current.as_deref() != Some(token.as_str()) {
                debug!(job = %self.storage.job_name(), item, "Lost failover claim to another instance");
                return Ok(false);
            }
        } else if !self.storage.is_job_node_existed(&record).await? {
            return Ok(false);
        }

        self.storage.remove_job_node_if_existed(&record).await?;
        self.storage
            .fill_job_node(
                &self.storage.path().item_node(item, ItemNode::Failover),
                self.instance.id(),
            )
            .await?;
        Ok(true)
    }

    async fn is_locally_running(&self) -> Result<bool> {
        for item in self.storage.get_sharding_item_keys().await? {
            let running = self.storage.path().item_node(item, ItemNode::Running);
            if self.storage.get_job_node_data_directly(&running).await?.as_deref()
                == Some(self.instance.id())
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Items claimed for failover by `instance_id`
    pub async fn get_failover_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let mut items = Vec::new();
        for item in self.storage.get_sharding_item_keys().await? {
            let claim = self.storage.path().item_node(item, ItemNode::Failover);
            if self.storage.get_job_node_data_directly(&claim).await?.as_deref() == Some(instance_id) {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Items claimed for failover by the local instance
    pub async fn get_local_failover_items(&self) -> Result<Vec<u32>> {
        self.get_failover_items(self.instance.id()).await
    }

    /// Subset of `items` claimed for failover by some other instance
    pub async fn get_local_take_off_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut taken = Vec::new();
        for &item in items {
            let claim = self.storage.path().item_node(item, ItemNode::Failover);
            match self.storage.get_job_node_data_directly(&claim).await? {
                Some(owner) if owner != self.instance.id() => taken.push(item),
                _ => {}
            }
        }
        Ok(taken)
    }

    /// Remove the failover claims of completed items
    pub async fn update_failover_complete(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .remove_job_node_if_existed(&self.storage.path().item_node(item, ItemNode::Failover))
                .await?;
        }
        Ok(())
    }

    /// Purge every queued record and claim (failover turned off)
    pub async fn remove_failover_info(&self) -> Result<()> {
        self.storage
            .remove_job_node_if_existed(&self.storage.path().failover_queue_node())
            .await?;
        for item in self.storage.get_sharding_item_keys().await? {
            self.storage
                .remove_job_node_if_existed(&self.storage.path().item_node(item, ItemNode::Failover))
                .await?;
        }
        warn!(job = %self.storage.job_name(), "Failover disabled, queued failover records purged");
        Ok(())
    }
}
