//! Listener lifetime and action dispatch
//!
//! One dispatch task per job consumes the job subtree's change events, runs
//! the handlers and applies the resulting actions through the services. A
//! failing action is logged and counted; the remaining actions and later
//! events are still processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handlers::{actions_for, Action, ListenerContext};
use crate::coordinator::JobServices;
use crate::error::Result;
use crate::metrics;
use crate::registry::{DataWatch, RegistryEvent, WatchItem};

/// Owns the dispatch task of one job
pub struct ListenerManager {
    services: JobServices,
    shutting_down: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerManager {
    pub fn new(services: JobServices, shutting_down: Arc<AtomicBool>) -> Self {
        Self {
            services,
            shutting_down,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to the job subtree and start dispatching; no-op when running
    pub async fn start_all_listeners(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let watch = self.services.storage.watch_job();
        let services = self.services.clone();
        let shutting_down = Arc::clone(&self.shutting_down);
        *task = Some(tokio::spawn(dispatch_loop(services, shutting_down, watch)));
        info!(job = %self.services.job_name(), "Listeners started");
    }

    /// Stop dispatching; events after this point are not handled
    pub async fn stop_all_listeners(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            // Cancellation is the expected outcome
            let _ = handle.await;
            info!(job = %self.services.job_name(), "Listeners stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

async fn dispatch_loop(services: JobServices, shutting_down: Arc<AtomicBool>, mut watch: DataWatch) {
    while let Some(item) = watch.recv().await {
        match item {
            WatchItem::Event(event) => {
                dispatch(&services, shutting_down.load(Ordering::SeqCst), &event).await;
            }
            WatchItem::Lagged(missed) => {
                warn!(
                    job = %services.job_name(),
                    missed,
                    "Listener fell behind registry events, requesting resharding"
                );
                metrics::record_watch_lagged(services.job_name(), missed);
                if let Err(e) = services.sharding.set_resharding_flag().await {
                    metrics::record_listener_error(services.job_name(), "set_resharding_flag");
                    warn!(job = %services.job_name(), error = %e, "Failed to set resharding flag");
                }
            }
        }
    }
    debug!(job = %services.job_name(), "Registry event stream closed");
}

/// Handle one event. Returns the number of actions that failed.
pub async fn dispatch(services: &JobServices, shutting_down: bool, event: &RegistryEvent) -> usize {
    let current_config = services.config.cached().await;
    let ctx = ListenerContext {
        path: services.storage.path(),
        local_instance: services.local_instance(),
        current_config: current_config.as_ref(),
        shutting_down,
    };
    let actions = actions_for(event, &ctx);

    let mut failed = 0;
    for action in actions {
        debug!(
            job = %services.job_name(),
            path = %event.path,
            action = action.name(),
            "Applying listener action"
        );
        let name = action.name();
        if let Err(e) = apply(services, action).await {
            failed += 1;
            metrics::record_listener_error(services.job_name(), name);
            warn!(
                job = %services.job_name(),
                path = %event.path,
                action = name,
                error = %e,
                "Listener action failed"
            );
        }
    }
    failed
}

async fn apply(services: &JobServices, action: Action) -> Result<()> {
    match action {
        Action::SetReshardingFlag => services.sharding.set_resharding_flag().await,
        Action::RefreshConfig(config) => {
            services.config.refresh_cache(*config).await;
            Ok(())
        }
        Action::InvalidateConfig => {
            services.config.invalidate_cache().await;
            Ok(())
        }
        Action::CrashFailover { instance_id } => recover_crashed_instance(services, &instance_id).await,
        Action::RemoveFailoverInfo => services.failover.remove_failover_info().await,
        Action::ElectLeader => {
            if services.instance.is_local_job_instance_existed().await? {
                services.leader.elect_leader().await?;
            }
            Ok(())
        }
        Action::LeaveElection => {
            if services.leader.is_leader().await? {
                info!(
                    job = %services.job_name(),
                    instance = %services.local_instance(),
                    "Local server disabled, giving up leadership"
                );
            }
            services.leader.remove_leader().await
        }
        Action::ClearRunningInfo => services.execution.clear_all_running_info().await,
        Action::ClearMisfireInfo => services.misfire.clear_all_misfire().await,
        Action::ReRegisterInstance => {
            info!(
                job = %services.job_name(),
                instance = %services.local_instance(),
                "Local instance node lost, registering again"
            );
            let enabled = !services.config.load(true).await?.disabled;
            services.server.persist_online(enabled).await?;
            services.instance.persist_online().await?;
            services.leader.elect_leader().await?;
            Ok(())
        }
    }
}

/// Requeue what a vanished instance was running or had claimed
async fn recover_crashed_instance(services: &JobServices, instance_id: &str) -> Result<()> {
    for item in services.failover.get_failover_items(instance_id).await? {
        services.failover.requeue_claimed_item(item).await?;
    }

    let crashed = services.sharding.get_crashed_sharding_items(instance_id).await?;
    for &item in &crashed {
        // The running marker is the only trace of the item; drop it once queued
        services.failover.set_crashed_failover_flag(item).await?;
        services.execution.clear_running_info(&[item]).await?;
    }
    if !crashed.is_empty() {
        info!(
            job = %services.job_name(),
            crashed_instance = %instance_id,
            items = ?crashed,
            "Recovered items of crashed instance"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::coordinator::test_support::{fast_engine_config, TestNode};
    use crate::models::JobInstance;
    use crate::registry::{
        EventKind, MemoryRegistry, MemoryRegistryClient, RegistryCenter, RegistryError,
        RegistryResult,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Session whose next write below `/failover/` fails as if the registry dropped out
    struct FlakyFailoverWrites {
        inner: MemoryRegistryClient,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl RegistryCenter for FlakyFailoverWrites {
        async fn get(&self, key: &str) -> RegistryResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn get_directly(&self, key: &str) -> RegistryResult<Option<String>> {
            self.inner.get_directly(key).await
        }

        async fn is_existed(&self, key: &str) -> RegistryResult<bool> {
            self.inner.is_existed(key).await
        }

        async fn get_children_keys(&self, key: &str) -> RegistryResult<Vec<String>> {
            self.inner.get_children_keys(key).await
        }

        async fn get_num_children(&self, key: &str) -> RegistryResult<usize> {
            self.inner.get_num_children(key).await
        }

        async fn persist(&self, key: &str, value: &str) -> RegistryResult<()> {
            if key.contains("/failover/") && self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(RegistryError::Unavailable);
            }
            self.inner.persist(key, value).await
        }

        async fn update(&self, key: &str, value: &str) -> RegistryResult<()> {
            self.inner.update(key, value).await
        }

        async fn persist_ephemeral(&self, key: &str, value: &str) -> RegistryResult<()> {
            self.inner.persist_ephemeral(key, value).await
        }

        async fn persist_sequential(&self, key: &str, value: &str) -> RegistryResult<String> {
            self.inner.persist_sequential(key, value).await
        }

        async fn persist_ephemeral_sequential(
            &self,
            key: &str,
            value: &str,
        ) -> RegistryResult<String> {
            self.inner.persist_ephemeral_sequential(key, value).await
        }

        async fn remove(&self, key: &str) -> RegistryResult<()> {
            self.inner.remove(key).await
        }

        fn watch(&self, key: &str) -> DataWatch {
            self.inner.watch(key)
        }
    }

    fn job() -> JobConfig {
        JobConfig::builder("job", "0 * * * * ?", 3)
            .failover(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_crash_queues_running_items() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job()).await;
        node.storage
            .fill_job_node("sharding/2/running", "10.0.0.2@-@1")
            .await
            .unwrap();

        let event = RegistryEvent::new(EventKind::Removed, "/job/instances/10.0.0.2@-@1", None);
        assert_eq!(dispatch(&node.services, false, &event).await, 0);

        assert_eq!(node.services.failover.get_queued_items().await.unwrap(), vec![2]);
        assert!(!node.storage.is_job_node_existed("sharding/2/running").await.unwrap());
        assert!(node.services.sharding.is_need_sharding().await.unwrap());

        // Duplicate delivery changes nothing
        assert_eq!(dispatch(&node.services, false, &event).await, 0);
        assert_eq!(node.services.failover.get_queued_items().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_dispatch_counts_failures_and_continues() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job()).await;
        registry.set_available(false).await;

        let event = RegistryEvent::new(EventKind::Removed, "/job/instances/10.0.0.2@-@1", None);
        // Both the resharding flag and the crash recovery fail
        assert_eq!(dispatch(&node.services, false, &event).await, 2);
    }

    #[tokio::test]
    async fn test_crash_recovery_survives_failed_queue_write() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job()).await;
        node.storage
            .fill_job_node("sharding/2/running", "10.0.0.2@-@1")
            .await
            .unwrap();

        let flaky: Arc<dyn RegistryCenter> = Arc::new(FlakyFailoverWrites {
            inner: registry.connect().await,
            fail_next: AtomicBool::new(true),
        });
        let services = JobServices::new(
            flaky,
            "job",
            JobInstance::new("10.0.0.3", 1),
            &fast_engine_config(),
        );

        let event = RegistryEvent::new(EventKind::Removed, "/job/instances/10.0.0.2@-@1", None);
        assert_eq!(dispatch(&services, false, &event).await, 1);

        // The running marker still names the crashed instance
        assert!(services.failover.get_queued_items().await.unwrap().is_empty());
        assert_eq!(
            node.storage.get_job_node_data("sharding/2/running").await.unwrap().as_deref(),
            Some("10.0.0.2@-@1")
        );

        // Redelivery completes the recovery
        assert_eq!(dispatch(&services, false, &event).await, 0);
        assert_eq!(services.failover.get_queued_items().await.unwrap(), vec![2]);
        assert!(!node.storage.is_job_node_existed("sharding/2/running").await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_disabled_local_server_hands_leadership_over() {
        let registry = MemoryRegistry::new();
        let leader = TestNode::start(&registry, "10.0.0.1", job()).await;
        let follower = TestNode::start(&registry, "10.0.0.2", job()).await;
        assert!(leader.services.leader.is_leader().await.unwrap());

        leader.services.server.disable_server("10.0.0.1").await.unwrap();
        let event = RegistryEvent::new(
            EventKind::Updated,
            "/job/servers/10.0.0.1",
            Some("DISABLED".to_string()),
        );
        assert_eq!(dispatch(&leader.services, false, &event).await, 0);
        assert!(!leader.services.leader.is_leader().await.unwrap());
        assert!(follower.services.leader.is_leader().await.unwrap());

        // A redelivered latch event does not bring the disabled server back
        let latch = RegistryEvent::new(
            EventKind::Removed,
            "/job/leader/election/latch/0000000000",
            None,
        );
        assert_eq!(dispatch(&leader.services, false, &latch).await, 0);
        assert!(follower.services.leader.is_leader().await.unwrap());
    }

    #[tokio::test]
    async fn test_listeners_react_to_registry_events() {
        let registry = MemoryRegistry::new();
        let node = TestNode::start(&registry, "10.0.0.1", job()).await;
        let manager = ListenerManager::new(node.services.clone(), Arc::new(AtomicBool::new(false)));
        manager.start_all_listeners().await;
        assert!(manager.is_running().await);

        let peer = registry.connect().await;
        peer.persist_ephemeral("/job/instances/10.0.0.2@-@1", "10.0.0.2")
            .await
            .unwrap();

        let mut flagged = false;
        for _ in 0..100 {
            if node.services.sharding.is_need_sharding().await.unwrap() {
                flagged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flagged);

        manager.stop_all_listeners().await;
        assert!(!manager.is_running().await);
    }
}
