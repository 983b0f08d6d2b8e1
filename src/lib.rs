//! jobshard - Distributed sharded job coordination
//!
//! Splits a job into a fixed number of sharding items and spreads them over
//! the instances currently running it. Instances agree through a shared
//! hierarchical registry: one of them is elected leader and writes the item
//! assignment, the others wait for it. Items of a crashed instance are
//! queued for failover and claimed by idle survivors; triggers that fire
//! while an item is still running are recorded as misfires and caught up
//! once.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`registry`] - Registry contract, change events and an in-memory registry
//! - [`node`] - Job path layout and job-scoped node storage
//! - [`config`] - Job configuration document and engine settings
//! - [`coordinator`] - Coordination services (leader, sharding, failover, ...)
//! - [`listener`] - Reactions to registry change events
//! - [`scheduler`] - Sharding strategies and the per-job execution cycle
//! - [`models`] - Instance identity and sharding context
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Retry with backoff and small helpers
//!
//! # Example
//!
//! ```no_run
//! use jobshard::config::{EngineConfig, JobConfig};
//! use jobshard::registry::MemoryRegistry;
//! use jobshard::scheduler::JobCoordinator;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = MemoryRegistry::new();
//!     let session = Arc::new(registry.connect().await);
//!     let job = JobConfig::builder("settlement", "0 0/5 * * * ?", 4).build()?;
//!     let coordinator = JobCoordinator::new(session, job, &EngineConfig::from_env()?)?;
//!     coordinator.register_start_up().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod models;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{EngineConfig, JobConfig, JobType};
    pub use crate::error::{Error, ErrorCategory, JobShardErrorTrait, Result};
    pub use crate::models::{ExecutionSource, JobInstance, ShardingContext};
    pub use crate::registry::{MemoryRegistry, RegistryCenter};
    pub use crate::scheduler::{
        CycleReport, JobCoordinator, ShardedJob, ShardingStrategyType, TriggerEvent,
    };
}

// Direct re-exports for convenience
pub use models::{ExecutionSource, JobInstance, ShardingContext};
