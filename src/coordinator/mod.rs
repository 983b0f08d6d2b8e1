//! Coordination services for one job
//!
//! Every service works on the job's registry subtree only; no state is shared
//! between jobs beyond the registry itself.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 JobServices                  │
//! │                                              │
//! │  ConfigurationService   /<job>/config        │
//! │  ServerService          /<job>/servers       │
//! │  InstanceService        /<job>/instances     │
//! │  LeaderService          /<job>/leader        │
//! │  ShardingService        /<job>/sharding      │
//! │  ExecutionService       sharding/<i>/running │
//! │  MisfireService         sharding/<i>/misfire │
//! │  FailoverService        /<job>/failover      │
//! │  ReconcileService       periodic repair      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use jobshard::coordinator::JobServices;
//!
//! let services = JobServices::new(registry, "order_job", instance, &engine_config);
//! services.sharding.sharding_if_necessary().await?;
//! let items = services.sharding.get_local_sharding_items().await?;
//! ```

pub mod config;
pub mod execution;
pub mod failover;
pub mod instance;
pub mod leader;
pub mod misfire;
pub mod reconcile;
pub mod server;
pub mod sharding;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::models::JobInstance;
use crate::node::JobNodeStorage;
use crate::registry::RegistryCenter;

// Re-export main types
pub use config::ConfigurationService;
pub use execution::ExecutionService;
pub use failover::FailoverService;
pub use instance::InstanceService;
pub use leader::{LeaderElection, LeaderService};
pub use misfire::MisfireService;
pub use reconcile::ReconcileService;
pub use server::{ServerService, SERVER_DISABLED};
pub use sharding::{compute_plan, ShardingService};

/// The full service set of one job, wired to one registry session
#[derive(Clone)]
pub struct JobServices {
    pub storage: JobNodeStorage,
    pub config: ConfigurationService,
    pub server: ServerService,
    pub instance: InstanceService,
    pub leader: LeaderService,
    pub failover: FailoverService,
    pub execution: ExecutionService,
    pub misfire: MisfireService,
    pub sharding: ShardingService,
    pub reconcile: ReconcileService,
}

impl JobServices {
    pub fn new(
        registry: Arc<dyn RegistryCenter>,
        job_name: &str,
        instance: JobInstance,
        engine: &EngineConfig,
    ) -> Self {
        let storage = JobNodeStorage::new(registry, job_name);
        let poll = engine.poll_backoff();

        let config = ConfigurationService::new(storage.clone());
        let server = ServerService::new(storage.clone(), instance.server_ip());
        let instance_service = InstanceService::new(storage.clone(), server.clone(), instance.clone());
        let leader = LeaderService::new(
            storage.clone(),
            server.clone(),
            instance.clone(),
            poll.clone(),
            engine.leader_wait_timeout(),
        );
        let failover = FailoverService::new(
            storage.clone(),
            config.clone(),
            instance.clone(),
            engine.coordination.failover_claim_token,
        );
        let execution = ExecutionService::new(
            storage.clone(),
            config.clone(),
            failover.clone(),
            instance,
        );
        let misfire = MisfireService::new(storage.clone(), config.clone(), execution.clone());
        let sharding = ShardingService::new(
            storage.clone(),
            config.clone(),
            instance_service.clone(),
            leader.clone(),
            execution.clone(),
            poll,
            engine.sharding_wait_timeout(),
        );
        let reconcile = ReconcileService::new(sharding.clone(), leader.clone());

        Self {
            storage,
            config,
            server,
            instance: instance_service,
            leader,
            failover,
            execution,
            misfire,
            sharding,
            reconcile,
        }
    }

    pub fn job_name(&self) -> &str {
        self.storage.job_name()
    }

    pub fn local_instance(&self) -> &JobInstance {
        self.instance.local_instance()
    }
}
