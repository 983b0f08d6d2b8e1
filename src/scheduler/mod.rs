//! Job execution on top of the coordination services
//!
//! # Overview
//!
//! The cron engine that fires triggers is not part of this crate. A trigger
//! source calls [`JobCoordinator::execute`] with the job's business logic; the
//! coordinator decides which sharding items this instance runs, records
//! running state, handles misfires and claims failover work.
//!
//! # Modules
//!
//! - [`strategy`] - Sharding strategies mapping items onto instances
//! - [`job`] - Per-job coordinator and the execution cycle
//! - [`trigger`] - Out-of-schedule trigger requests for the cron engine
//!
//! # Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use jobshard::config::{EngineConfig, JobConfig};
//! use jobshard::models::ShardingContext;
//! use jobshard::registry::MemoryRegistry;
//! use jobshard::scheduler::{JobCoordinator, ShardedJob};
//! use std::sync::Arc;
//!
//! struct Report;
//!
//! #[async_trait]
//! impl ShardedJob for Report {
//!     async fn execute(&self, ctx: &ShardingContext, item: u32) -> anyhow::Result<()> {
//!         println!("{} item {}", ctx.job_name, item);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = MemoryRegistry::new();
//! let session = Arc::new(registry.connect().await);
//! let job = JobConfig::builder("report", "0 * * * * ?", 3).build()?;
//! let coordinator = JobCoordinator::new(session, job, &EngineConfig::default())?;
//!
//! coordinator.register_start_up().await?;
//! let report = coordinator.execute(&Report).await?;
//! println!("ran {:?}", report.executed);
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod job;
pub mod strategy;
pub mod trigger;

pub use job::{CycleReport, ExecutedBatch, JobCoordinator, ShardedJob};
pub use strategy::{
    AverageAllocationStrategy, JobShardingStrategy, OdevityStrategy, RoundRobinStrategy,
    ShardingPlan, ShardingStrategyType,
};
pub use trigger::{TriggerBus, TriggerEvent};
