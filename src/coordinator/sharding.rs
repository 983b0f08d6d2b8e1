//! Sharding assignment
//!
//! # States per job
//!
//! ```text
//! STABLE --topology/config change--> NEEDS_RESHARD (sharding/necessary)
//!        --leader starts pass-------> RESHARDING    (sharding/processing)
//!        --all items persisted------> STABLE
//! ```
//!
//! Only the leader writes `sharding/<item>/instance`. The pass is idempotent
//! rather than atomic: the flag is cleared only after every item is written,
//! so a leader crashing mid-pass leaves the flag behind and its successor
//! redoes the same deterministic computation. Items whose owner did not
//! change are not rewritten.

use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::config::ConfigurationService;
use super::execution::ExecutionService;
use super::instance::InstanceService;
use super::leader::LeaderService;
use crate::config::JobConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::JobInstance;
use crate::node::path::{NECESSARY_NODE, PROCESSING_NODE};
use crate::node::{ItemNode, JobNodeStorage};
use crate::scheduler::strategy::{ShardingPlan, ShardingStrategyType};
use crate::utils::retry::{wait_until, RetryConfig};

/// Computes, persists and queries sharding assignments
#[derive(Clone)]
pub struct ShardingService {
    storage: JobNodeStorage,
    config: ConfigurationService,
    instances: InstanceService,
    leader: LeaderService,
    execution: ExecutionService,
    poll: RetryConfig,
    wait_timeout: Duration,
}

impl ShardingService {
    pub fn new(
        storage: JobNodeStorage,
        config: ConfigurationService,
        instances: InstanceService,
        leader: LeaderService,
        execution: ExecutionService,
        poll: RetryConfig,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            config,
            instances,
            leader,
            execution,
            poll,
            wait_timeout,
        }
    }

    /// Mark the job as needing a resharding pass; idempotent
    pub async fn set_resharding_flag(&self) -> Result<()> {
        self.storage.create_job_node_if_needed(NECESSARY_NODE).await?;
        Ok(())
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        Ok(self.storage.is_job_node_existed(NECESSARY_NODE).await?)
    }

    async fn is_sharding_in_progress(&self) -> Result<bool> {
        Ok(self.storage.is_job_node_existed(NECESSARY_NODE).await?
            || self.storage.is_job_node_existed(PROCESSING_NODE).await?)
    }

    /// Reshard if the flag is set.
    ///
    /// The leader computes and persists the assignment. Any other instance
    /// waits until the flag and the processing marker are gone, bounded by
    /// the sharding wait timeout. With no available instances the flag stays
    /// set and the job is paused.
    pub async fn sharding_if_necessary(&self) -> Result<()> {
        let available = self.instances.get_available_job_instances().await?;
        if available.is_empty() || !self.is_need_sharding().await? {
            return Ok(());
        }
        if !self.instances.is_local_job_instance_existed().await? {
            debug!(job = %self.storage.job_name(), "Local instance offline, sharding skipped");
            return Ok(());
        }

        if self.leader.is_leader_until_block().await? {
            return self.reshard(available).await;
        }

        self.block_until_sharding_completed().await?;
        // The previous leader may have crashed while we waited
        if self.is_need_sharding().await? && self.leader.is_leader().await? {
            let available = self.instances.get_available_job_instances().await?;
            if !available.is_empty() {
                return self.reshard(available).await;
            }
        }
        Ok(())
    }

    async fn block_until_sharding_completed(&self) -> Result<()> {
        let done = wait_until(&self.poll, self.wait_timeout, || async move {
            Ok(!self.is_sharding_in_progress().await? || self.leader.is_leader().await?)
        })
        .await?;

        if done {
            Ok(())
        } else {
            Err(Error::ShardingTimeout {
                job_name: self.storage.job_name().to_string(),
                waited_ms: self.wait_timeout.as_millis() as u64,
            })
        }
    }

    async fn reshard(&self, available: Vec<JobInstance>) -> Result<()> {
        let started = Instant::now();
        let config = self.config.load(false).await?;
        self.wait_for_running_items(&config).await?;

        let leader = self.leader.local_instance();
        self.storage
            .fill_ephemeral_job_node(PROCESSING_NODE, leader.id())
            .await?;
        self.reset_sharding_info(config.sharding_total_count).await?;

        let plan = compute_plan(&config, &available)?;
        let mut rewritten = 0;
        for (instance, items) in &plan {
            for &item in items {
                let node = self.storage.path().item_node(item, ItemNode::Instance);
                if self
                    .storage
                    .replace_job_node_if_changed(&node, instance.id())
                    .await?
                {
                    debug!(job = %config.job_name, item, instance = %instance, "Item assigned");
                    rewritten += 1;
                }
            }
        }

        self.storage.remove_job_node_if_existed(NECESSARY_NODE).await?;
        self.storage.remove_job_node_if_existed(PROCESSING_NODE).await?;

        metrics::record_resharding(&config.job_name, rewritten, started.elapsed().as_secs_f64());
        info!(
            job = %config.job_name,
            instances = available.len(),
            total = config.sharding_total_count,
            rewritten,
            "Resharding completed"
        );
        Ok(())
    }

    async fn wait_for_running_items(&self, config: &JobConfig) -> Result<()> {
        if !config.monitor_execution {
            return Ok(());
        }
        let idle = wait_until(&self.poll, self.wait_timeout, || async move {
            Ok(!self.execution.has_any_running_items().await?)
        })
        .await?;
        if !idle {
            warn!(
                job = %config.job_name,
                waited_ms = self.wait_timeout.as_millis() as u64,
                "Items still running, resharding anyway"
            );
        }
        Ok(())
    }

    /// Create `sharding/<i>` for every item and drop items beyond the total
    async fn reset_sharding_info(&self, total: u32) -> Result<()> {
        for item in 0..total {
            self.storage
                .create_job_node_if_needed(&self.storage.path().item_root_node(item))
                .await?;
        }
        for item in self.storage.get_sharding_item_keys().await? {
            if item >= total {
                self.storage
                    .remove_job_node_if_existed(&self.storage.path().item_root_node(item))
                    .await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Items assigned to `instance_id`; empty when that instance is unavailable
    pub async fn get_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let instance = JobInstance::from_id(instance_id);
        if !self.instances.is_available(&instance).await? {
            return Ok(Vec::new());
        }
        let total = self.config.load(true).await?.sharding_total_count;
        let mut items = Vec::new();
        for item in 0..total {
            let node = self.storage.path().item_node(item, ItemNode::Instance);
            if self.storage.get_job_node_data(&node).await?.as_deref() == Some(instance_id) {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Items assigned to the local instance
    pub async fn get_local_sharding_items(&self) -> Result<Vec<u32>> {
        let local = self.instances.local_instance().id().to_string();
        self.get_sharding_items(&local).await
    }

    /// Items `instance_id` was executing when it went away
    pub async fn get_crashed_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        self.execution.get_running_items_of(instance_id).await
    }

    /// Whether some item is assigned to an instance that is not online
    pub async fn has_sharding_info_in_offline_servers(&self) -> Result<bool> {
        let online: HashSet<String> = self
            .instances
            .get_all_job_instances()
            .await?
            .into_iter()
            .map(|i| i.job_instance_id)
            .collect();
        let total = self.config.load(true).await?.sharding_total_count;
        for item in 0..total {
            let node = self.storage.path().item_node(item, ItemNode::Instance);
            match self.storage.get_job_node_data_directly(&node).await? {
                Some(owner) if online.contains(&owner) => {}
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------------
    // Item enable/disable
    // ------------------------------------------------------------------------

    /// Disable or re-enable one item (operator action)
    pub async fn set_item_disabled(&self, item: u32, disabled: bool) -> Result<()> {
        let total = self.config.load(false).await?.sharding_total_count;
        if item >= total {
            return Err(Error::InvalidShardingItem { item, total });
        }
        let node = self.storage.path().item_node(item, ItemNode::Disabled);
        if disabled {
            self.storage.create_job_node_if_needed(&node).await?;
        } else {
            self.storage.remove_job_node_if_existed(&node).await?;
        }
        info!(job = %self.storage.job_name(), item, disabled, "Sharding item state changed");
        Ok(())
    }

    /// Subset of `items` disabled by an operator
    pub async fn get_disabled_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut disabled = Vec::new();
        for &item in items {
            let node = self.storage.path().item_node(item, ItemNode::Disabled);
            if self.storage.is_job_node_existed(&node).await? {
                disabled.push(item);
            }
        }
        Ok(disabled)
    }
}

/// Assignment the configured strategy produces for `instances`
pub fn compute_plan(config: &JobConfig, instances: &[JobInstance]) -> Result<ShardingPlan> {
    let strategy = ShardingStrategyType::parse(&config.job_sharding_strategy_type)?.strategy();
    let mut sorted = instances.to_vec();
    sorted.sort();
    Ok(strategy.sharding(&sorted, &config.job_name, config.sharding_total_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_support::TestNode;
    use crate::registry::MemoryRegistry;

    fn job(count: u32) -> JobConfig {
        JobConfig::builder("job", "0 * * * * ?", count)
            .failover(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_instance_owns_all_items() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job(3)).await;

        node.services.sharding.set_resharding_flag().await.unwrap();
        node.services.sharding.sharding_if_necessary().await.unwrap();

        assert!(!node.services.sharding.is_need_sharding().await.unwrap());
        assert_eq!(
            node.services.sharding.get_local_sharding_items().await.unwrap(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_no_instances_leaves_flag_set() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job(3)).await;
        node.services.instance.remove_instance().await.unwrap();

        node.services.sharding.set_resharding_flag().await.unwrap();
        node.services.sharding.sharding_if_necessary().await.unwrap();
        assert!(node.services.sharding.is_need_sharding().await.unwrap());
    }

    #[tokio::test]
    async fn test_resharding_is_idempotent() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job(4)).await;
        let sharding = &node.services.sharding;

        sharding.set_resharding_flag().await.unwrap();
        sharding.sharding_if_necessary().await.unwrap();
        let version = registry.version("/job/sharding/3/instance").await;

        sharding.set_resharding_flag().await.unwrap();
        sharding.sharding_if_necessary().await.unwrap();
        assert_eq!(registry.version("/job/sharding/3/instance").await, version);
        assert_eq!(version, Some(0));
    }

    #[tokio::test]
    async fn test_shrinking_total_removes_items() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job(4)).await;
        let sharding = &node.services.sharding;
        sharding.set_resharding_flag().await.unwrap();
        sharding.sharding_if_necessary().await.unwrap();

        node.services.config.persist(&job(2)).await.unwrap();
        sharding.set_resharding_flag().await.unwrap();
        sharding.sharding_if_necessary().await.unwrap();

        assert_eq!(
            node.storage.get_sharding_item_keys().await.unwrap(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn test_disabled_server_gets_no_items() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job(2)).await;
        let sharding = &node.services.sharding;
        sharding.set_resharding_flag().await.unwrap();
        sharding.sharding_if_necessary().await.unwrap();

        node.services.server.disable_server("10.0.0.1").await.unwrap();
        assert!(sharding.get_local_sharding_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_assignment_detected() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job(2)).await;
        let sharding = &node.services.sharding;

        assert!(sharding.has_sharding_info_in_offline_servers().await.unwrap());
        sharding.set_resharding_flag().await.unwrap();
        sharding.sharding_if_necessary().await.unwrap();
        assert!(!sharding.has_sharding_info_in_offline_servers().await.unwrap());

        node.storage
            .fill_job_node("sharding/1/instance", "10.9.9.9@-@1")
            .await
            .unwrap();
        assert!(sharding.has_sharding_info_in_offline_servers().await.unwrap());
    }

    #[tokio::test]
    async fn test_item_disable_validates_range() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job(2)).await;
        let sharding = &node.services.sharding;

        sharding.set_item_disabled(1, true).await.unwrap();
        assert_eq!(sharding.get_disabled_items(&[0, 1]).await.unwrap(), vec![1]);
        sharding.set_item_disabled(1, false).await.unwrap();
        assert!(sharding.get_disabled_items(&[0, 1]).await.unwrap().is_empty());

        assert!(matches!(
            sharding.set_item_disabled(2, true).await,
            Err(Error::InvalidShardingItem { item: 2, total: 2 })
        ));
    }

    #[tokio::test]
    async fn test_follower_times_out_without_leader_pass() {
        let registry = MemoryRegistry::new();
        let leader = TestNode::start(&registry, "10.0.0.1", job(2)).await;
        let follower = TestNode::start(&registry, "10.0.0.2", job(2)).await;
        assert!(leader.services.leader.is_leader().await.unwrap());

        follower.services.sharding.set_resharding_flag().await.unwrap();
        let result = follower.services.sharding.sharding_if_necessary().await;
        assert!(matches!(result, Err(Error::ShardingTimeout { .. })));
    }
}
