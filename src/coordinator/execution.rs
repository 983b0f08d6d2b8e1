//! Execution markers
//!
//! With `monitor_execution` on, every executing item carries a persistent
//! `sharding/<item>/running` marker whose value is the executing instance.
//! The marker outlives a crash of its owner; the crash listener uses it to
//! find the items that need failover.

use tracing::debug;

use super::config::ConfigurationService;
use super::failover::FailoverService;
use crate::error::Result;
use crate::models::{ExecutionSource, JobInstance, ShardingContext};
use crate::node::{ItemNode, JobNodeStorage};

/// Records the begin and end of item executions
#[derive(Clone)]
pub struct ExecutionService {
    storage: JobNodeStorage,
    config: ConfigurationService,
    failover: FailoverService,
    instance: JobInstance,
}

impl ExecutionService {
    pub fn new(
        storage: JobNodeStorage,
        config: ConfigurationService,
        failover: FailoverService,
        instance: JobInstance,
    ) -> Self {
        Self {
            storage,
            config,
            failover,
            instance,
        }
    }

    /// Mark the items of `context` as running on this instance
    pub async fn register_job_begin(&self, context: &ShardingContext) -> Result<()> {
        if !self.config.load(true).await?.monitor_execution {
            return Ok(());
        }
        for item in context.sharding_items() {
            self.storage
                .fill_job_node(
                    &self.storage.path().item_node(item, ItemNode::Running),
                    self.instance.id(),
                )
                .await?;
        }
        debug!(job = %context.job_name, items = ?context.sharding_items(), "Execution registered");
        Ok(())
    }

    /// Clear the running markers of `context` and complete failover claims
    pub async fn register_job_completed(&self, context: &ShardingContext) -> Result<()> {
        let items = context.sharding_items();
        if self.config.load(true).await?.monitor_execution {
            self.clear_running_info(&items).await?;
        }
        if context.execution_source == ExecutionSource::Failover {
            self.failover.update_failover_complete(&items).await?;
        }
        debug!(job = %context.job_name, items = ?items, "Execution completed");
        Ok(())
    }

    /// Whether any of `items` is marked running
    pub async fn has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.config.load(true).await?.monitor_execution {
            return Ok(false);
        }
        for &item in items {
            let running = self.storage.path().item_node(item, ItemNode::Running);
            if self.storage.is_job_node_existed(&running).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether any item of the job is marked running
    pub async fn has_any_running_items(&self) -> Result<bool> {
        let items = self.storage.get_sharding_item_keys().await?;
        self.has_running_items(&items).await
    }

    /// Items whose running marker names `instance_id`
    pub async fn get_running_items_of(&self, instance_id: &str) -> Result<Vec<u32>> {
        let mut items = Vec::new();
        for item in self.storage.get_sharding_item_keys().await? {
            let running = self.storage.path().item_node(item, ItemNode::Running);
            if self.storage.get_job_node_data_directly(&running).await?.as_deref() == Some(instance_id) {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub async fn clear_running_info(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .remove_job_node_if_existed(&self.storage.path().item_node(item, ItemNode::Running))
                .await?;
        }
        Ok(())
    }

    /// Remove every running marker of the job
    pub async fn clear_all_running_info(&self) -> Result<()> {
        let items = self.storage.get_sharding_item_keys().await?;
        self.clear_running_info(&items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::registry::{MemoryRegistry, RegistryCenter};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn service(registry: &MemoryRegistry, monitor: bool) -> ExecutionService {
        let client: Arc<dyn RegistryCenter> = Arc::new(registry.connect().await);
        let storage = JobNodeStorage::new(client, "job");
        let config = ConfigurationService::new(storage.clone());
        config
            .persist(
                &JobConfig::builder("job", "0 * * * * ?", 3)
                    .failover(true)
                    .monitor_execution(monitor)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        let instance = JobInstance::new("10.0.0.1", 1);
        let failover = FailoverService::new(storage.clone(), config.clone(), instance.clone(), false);
        ExecutionService::new(storage, config, failover, instance)
    }

    fn context(items: &[u32], source: ExecutionSource) -> ShardingContext {
        let params: BTreeMap<u32, String> = items.iter().map(|&i| (i, String::new())).collect();
        ShardingContext::new("job", 3, "", params, source, &JobInstance::new("10.0.0.1", 1))
    }

    #[tokio::test]
    async fn test_begin_and_complete() {
        let registry = MemoryRegistry::new();
        let service = service(&registry, true).await;
        let ctx = context(&[0, 2], ExecutionSource::NormalTrigger);

        service.register_job_begin(&ctx).await.unwrap();
        assert!(service.has_running_items(&[2]).await.unwrap());
        assert!(!service.has_running_items(&[1]).await.unwrap());
        assert_eq!(
            service.get_running_items_of("10.0.0.1@-@1").await.unwrap(),
            vec![0, 2]
        );

        service.register_job_completed(&ctx).await.unwrap();
        assert!(!service.has_any_running_items().await.unwrap());
    }

    #[tokio::test]
    async fn test_monitor_execution_off_writes_nothing() {
        let registry = MemoryRegistry::new();
        let service = service(&registry, false).await;
        service
            .register_job_begin(&context(&[1], ExecutionSource::NormalTrigger))
            .await
            .unwrap();
        assert!(registry.dump("/job/sharding").await.is_empty());
    }

    #[tokio::test]
    async fn test_failover_completion_removes_claim() {
        let registry = MemoryRegistry::new();
        let service = service(&registry, true).await;
        service
            .storage
            .fill_job_node("sharding/1/failover", "10.0.0.1@-@1")
            .await
            .unwrap();

        let ctx = context(&[1], ExecutionSource::Failover);
        service.register_job_begin(&ctx).await.unwrap();
        service.register_job_completed(&ctx).await.unwrap();
        assert!(!service
            .storage
            .is_job_node_existed("sharding/1/failover")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_clear_all_running_info() {
        let registry = MemoryRegistry::new();
        let service = service(&registry, true).await;
        service
            .register_job_begin(&context(&[0, 1, 2], ExecutionSource::NormalTrigger))
            .await
            .unwrap();
        service.clear_all_running_info().await.unwrap();
        assert!(!service.has_any_running_items().await.unwrap());
    }
}
