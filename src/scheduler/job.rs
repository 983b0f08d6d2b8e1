//! Per-job coordination context and execution cycle
//!
//! [`JobCoordinator`] owns everything one job needs in one process: the
//! services bound to a registry session, the listener manager, the
//! reconcile task and the trigger bus. There is no process-wide registry of
//! jobs; an application running several jobs holds several coordinators.
//!
//! # Cycle
//!
//! ```text
//! execute()
//!   ├── sharding_if_necessary()        leader reshards, others wait
//!   ├── sharding context               failover items first, else own items
//!   ├── misfire_if_running()           still running? record misfire, stop
//!   ├── begin / run items / complete
//!   ├── one misfire catch-up run       never loops
//!   └── failover_if_necessary()        claim a crashed item, publish trigger
//! ```
//!
//! # Shutdown
//!
//! The instance node is removed before the leader latch and before the
//! listeners stop, so peers reshard promptly. Peers only queue failover for
//! items that carry running markers of the departed instance, so a graceful
//! shutdown between executions creates no failover records.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::trigger::{TriggerBus, TriggerEvent};
use crate::config::{EngineConfig, JobConfig};
use crate::coordinator::JobServices;
use crate::error::Result;
use crate::listener::ListenerManager;
use crate::metrics;
use crate::models::{ExecutionSource, JobInstance, ShardingContext};
use crate::registry::RegistryCenter;
use crate::utils::process_id;
use crate::utils::retry::{with_retry, RetryConfig};

/// Business logic of a sharded job
#[async_trait]
pub trait ShardedJob: Send + Sync {
    /// Process one sharding item
    async fn execute(&self, context: &ShardingContext, item: u32) -> anyhow::Result<()>;
}

/// Items run in one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedBatch {
    pub source: ExecutionSource,
    pub items: Vec<u32>,
}

/// Outcome of one [`JobCoordinator::execute`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Executions in order (regular or failover run, then a misfire catch-up)
    pub executed: Vec<ExecutedBatch>,
    /// Items skipped because their previous run was still going
    pub misfired: Vec<u32>,
    /// Items whose execution returned an error
    pub failed: Vec<u32>,
    /// Items claimed for failover at the end of the cycle
    pub failover_claimed: Vec<u32>,
}

impl CycleReport {
    /// Every executed item for `source`
    pub fn items_for(&self, source: ExecutionSource) -> Vec<u32> {
        self.executed
            .iter()
            .filter(|b| b.source == source)
            .flat_map(|b| b.items.iter().copied())
            .collect()
    }
}

/// Coordination context of one job in this process
pub struct JobCoordinator {
    services: JobServices,
    listeners: ListenerManager,
    triggers: TriggerBus,
    local_config: JobConfig,
    bootstrap_retry: RetryConfig,
    shutting_down: Arc<AtomicBool>,
    reconcile_shutdown: watch::Sender<bool>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobCoordinator {
    /// Coordinator for this process, identified by the configured ip and the pid
    pub fn new(
        registry: Arc<dyn RegistryCenter>,
        job_config: JobConfig,
        engine: &EngineConfig,
    ) -> Result<Self> {
        let instance = JobInstance::new(&engine.local_ip(), process_id());
        Self::with_instance(registry, job_config, instance, engine)
    }

    /// Coordinator with an explicit instance identity
    pub fn with_instance(
        registry: Arc<dyn RegistryCenter>,
        job_config: JobConfig,
        instance: JobInstance,
        engine: &EngineConfig,
    ) -> Result<Self> {
        job_config.validate()?;
        engine.validate()?;

        let services = JobServices::new(registry, &job_config.job_name, instance, engine);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let listeners = ListenerManager::new(services.clone(), Arc::clone(&shutting_down));
        let (reconcile_shutdown, _) = watch::channel(false);

        Ok(Self {
            services,
            listeners,
            triggers: TriggerBus::new(),
            local_config: job_config,
            bootstrap_retry: engine.bootstrap_retry(),
            shutting_down,
            reconcile_shutdown,
            reconcile_task: Mutex::new(None),
        })
    }

    pub fn job_name(&self) -> &str {
        self.services.job_name()
    }

    pub fn local_instance(&self) -> &JobInstance {
        self.services.local_instance()
    }

    /// Services of this job, for operator actions and queries
    pub fn services(&self) -> &JobServices {
        &self.services
    }

    /// Subscribe to failover and misfire trigger requests
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<TriggerEvent> {
        self.triggers.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register this process with the job.
    ///
    /// Sets up the configuration (retrying transient registry errors), starts
    /// the listeners, brings the server and instance online, joins the leader
    /// election and requests resharding. Returns the effective configuration.
    pub async fn register_start_up(&self) -> Result<JobConfig> {
        let config_service = &self.services.config;
        let local = &self.local_config;
        let config = with_retry(&self.bootstrap_retry, move || {
            config_service.set_up(local.job_type, local)
        })
        .await?;

        self.listeners.start_all_listeners().await;

        let peers_online = !self
            .services
            .instance
            .get_all_job_instances()
            .await?
            .is_empty();
        self.services.server.persist_online(!config.disabled).await?;
        self.services.instance.persist_online().await?;
        if !peers_online {
            // Markers left by a previous fleet would block misfire and failover
            self.services.execution.clear_all_running_info().await?;
        }
        self.services.leader.elect_leader().await?;
        self.services.sharding.set_resharding_flag().await?;

        if config.reconcile_interval_minutes > 0 {
            let interval = Duration::from_secs(u64::from(config.reconcile_interval_minutes) * 60);
            let reconcile = self.services.reconcile.clone();
            let rx = self.reconcile_shutdown.subscribe();
            *self.reconcile_task.lock().await = Some(tokio::spawn(reconcile.run(interval, rx)));
        }

        info!(
            job = %self.job_name(),
            instance = %self.local_instance(),
            total = config.sharding_total_count,
            "Job registered"
        );
        Ok(config)
    }

    /// Leave the job gracefully
    pub async fn shutdown(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);

        // Nobody listening just means the task already ended
        let _ = self.reconcile_shutdown.send(true);
        if let Some(handle) = self.reconcile_task.lock().await.take() {
            let _ = handle.await;
        }

        let instance_removed = self.services.instance.remove_instance().await;
        let leader_removed = self.services.leader.remove_leader().await;
        self.listeners.stop_all_listeners().await;

        instance_removed?;
        leader_removed?;
        info!(job = %self.job_name(), instance = %self.local_instance(), "Job shut down");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run one trigger cycle of `job`.
    ///
    /// Registry failures abort the cycle before any item runs; the caller
    /// should skip this trigger and try again on the next.
    pub async fn execute(&self, job: &dyn ShardedJob) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        if self.is_shutting_down() {
            return Ok(report);
        }

        let config = self.services.config.load(true).await?;
        if config.disabled
            || !self
                .services
                .server
                .is_enable_server(self.local_instance().server_ip())
                .await?
        {
            debug!(job = %self.job_name(), "Job or server disabled, cycle skipped");
            return Ok(report);
        }

        self.services.sharding.sharding_if_necessary().await?;
        let context = self.get_sharding_context(&config).await?;
        let items = context.sharding_items();

        if self.services.misfire.misfire_if_running(&items).await? {
            report.misfired = items;
            return Ok(report);
        }

        self.run_items(job, &context, &mut report).await?;

        if self.services.misfire.is_execute_misfired(&items).await? {
            let misfired = self.services.misfire.get_misfired_items(&items).await?;
            self.services.misfire.clear_misfire(&misfired).await?;
            let catch_up = self.context_for(&config, misfired.clone(), ExecutionSource::Misfire)?;
            info!(job = %self.job_name(), items = ?misfired, "Running misfire catch-up");
            self.run_items(job, &catch_up, &mut report).await?;
            self.triggers
                .publish(TriggerEvent::misfire_catch_up(self.job_name(), misfired));
        }

        let claimed = self.services.failover.failover_if_necessary().await?;
        if !claimed.is_empty() {
            self.triggers
                .publish(TriggerEvent::failover_claimed(self.job_name(), claimed.clone()));
            report.failover_claimed = claimed;
        }
        Ok(report)
    }

    /// Items this instance should run now: its failover claims if it has
    /// any, otherwise its own items minus disabled ones and ones another
    /// instance took over.
    pub async fn get_sharding_context(&self, config: &JobConfig) -> Result<ShardingContext> {
        if config.failover {
            let failover_items = self.services.failover.get_local_failover_items().await?;
            if !failover_items.is_empty() {
                return self.context_for(config, failover_items, ExecutionSource::Failover);
            }
        }

        let mut items = self.services.sharding.get_local_sharding_items().await?;
        if config.failover {
            let taken = self.services.failover.get_local_take_off_items(&items).await?;
            items.retain(|i| !taken.contains(i));
        }
        let disabled = self.services.sharding.get_disabled_items(&items).await?;
        items.retain(|i| !disabled.contains(i));

        self.context_for(config, items, ExecutionSource::NormalTrigger)
    }

    fn context_for(
        &self,
        config: &JobConfig,
        items: Vec<u32>,
        source: ExecutionSource,
    ) -> Result<ShardingContext> {
        let parameters = config.item_parameters()?;
        let item_parameters = items
            .into_iter()
            .map(|i| (i, parameters.get(&i).cloned().unwrap_or_default()))
            .collect();
        Ok(ShardingContext::new(
            &config.job_name,
            config.sharding_total_count,
            &config.job_parameter,
            item_parameters,
            source,
            self.local_instance(),
        ))
    }

    async fn run_items(
        &self,
        job: &dyn ShardedJob,
        context: &ShardingContext,
        report: &mut CycleReport,
    ) -> Result<()> {
        if context.is_empty() {
            return Ok(());
        }
        let items = context.sharding_items();
        self.services.execution.register_job_begin(context).await?;

        let results =
            futures::future::join_all(items.iter().map(|&item| job.execute(context, item))).await;
        let mut failed = 0;
        for (&item, result) in items.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                report.failed.push(item);
                warn!(
                    job = %context.job_name,
                    item,
                    source = %context.execution_source,
                    error = %e,
                    "Sharding item execution failed"
                );
            }
        }

        self.services.execution.register_job_completed(context).await?;
        metrics::record_items_executed(
            &context.job_name,
            &context.execution_source.to_string(),
            items.len(),
            failed,
        );
        report.executed.push(ExecutedBatch {
            source: context.execution_source,
            items,
        });
        Ok(())
    }
}
