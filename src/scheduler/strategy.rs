//! Sharding strategies
//!
//! A strategy maps the sorted list of available instances and the job's
//! sharding total count to an item assignment. Strategies are pure and
//! deterministic: every instance computing the plan from the same registry
//! state gets the same answer, so a leader that crashes mid-write can be
//! replaced by one that redoes the identical pass.
//!
//! # Strategies
//!
//! - `AVG_ALLOCATION` (default): contiguous blocks, remainder from the tail
//! - `ODEVITY`: average allocation over an ascending or descending instance
//!   list, chosen by the parity of the job-name hash
//! - `ROUND_ROBIN`: average allocation after rotating the instance list by
//!   the job-name hash

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::models::JobInstance;
use crate::utils::java_string_hash;

/// Assignment of items to instances, ordered by instance id
pub type ShardingPlan = BTreeMap<JobInstance, Vec<u32>>;

/// Pluggable sharding algorithm
pub trait JobShardingStrategy: Send + Sync {
    /// Partition `[0, sharding_total_count)` across `instances`.
    ///
    /// `instances` must be sorted by id. An empty list yields an empty plan.
    fn sharding(
        &self,
        instances: &[JobInstance],
        job_name: &str,
        sharding_total_count: u32,
    ) -> ShardingPlan;

    /// Registry name of the strategy
    fn name(&self) -> &'static str;
}

// ============================================================================
// Strategy Selection
// ============================================================================

/// Built-in strategies, selected by name in the job configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShardingStrategyType {
    #[default]
    AverageAllocation,
    Odevity,
    RoundRobin,
}

impl ShardingStrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AverageAllocation => "AVG_ALLOCATION",
            Self::Odevity => "ODEVITY",
            Self::RoundRobin => "ROUND_ROBIN",
        }
    }

    /// Parse a strategy name; an empty name selects average allocation
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim() {
            "" | "AVG_ALLOCATION" => Ok(Self::AverageAllocation),
            "ODEVITY" => Ok(Self::Odevity),
            "ROUND_ROBIN" => Ok(Self::RoundRobin),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }

    /// Instantiate the strategy
    pub fn strategy(&self) -> Box<dyn JobShardingStrategy> {
        match self {
            Self::AverageAllocation => Box::new(AverageAllocationStrategy),
            Self::Odevity => Box::new(OdevityStrategy),
            Self::RoundRobin => Box::new(RoundRobinStrategy),
        }
    }
}

impl fmt::Display for ShardingStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Average Allocation
// ============================================================================

/// Contiguous blocks of `floor(total / n)` items per instance; the
/// `total mod n` items at the tail of the range go one each to the first
/// instances.
///
/// ```text
/// 3 instances, 8 items  => [0,1,6] [2,3,7] [4,5]
/// 3 instances, 10 items => [0,1,2,9] [3,4,5] [6,7,8]
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageAllocationStrategy;

impl AverageAllocationStrategy {
    fn allocate(instances: &[JobInstance], total: u32) -> Vec<(JobInstance, Vec<u32>)> {
        if instances.is_empty() {
            return Vec::new();
        }
        let n = instances.len() as u32;
        let per_instance = total / n;
        let remainder = total % n;

        instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                let i = i as u32;
                let start = i * per_instance;
                let mut items: Vec<u32> = (start..start + per_instance).collect();
                if i < remainder {
                    items.push(per_instance * n + i);
                }
                (instance.clone(), items)
            })
            .collect()
    }
}

impl JobShardingStrategy for AverageAllocationStrategy {
    fn sharding(&self, instances: &[JobInstance], _job_name: &str, total: u32) -> ShardingPlan {
        Self::allocate(instances, total).into_iter().collect()
    }

    fn name(&self) -> &'static str {
        ShardingStrategyType::AverageAllocation.as_str()
    }
}

// ============================================================================
// Hash-based Strategies
// ============================================================================

/// Odd job-name hash keeps the ascending instance order, even hash reverses
/// it, so jobs with few items do not all land on the first instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct OdevityStrategy;

impl JobShardingStrategy for OdevityStrategy {
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingPlan {
        let mut ordered = instances.to_vec();
        if java_string_hash(job_name) % 2 == 0 {
            ordered.reverse();
        }
        AverageAllocationStrategy::allocate(&ordered, total)
            .into_iter()
            .collect()
    }

    fn name(&self) -> &'static str {
        ShardingStrategyType::Odevity.as_str()
    }
}

/// Rotates the instance list by `|hash(job_name)| mod n` before average
/// allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinStrategy;

impl JobShardingStrategy for RoundRobinStrategy {
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingPlan {
        if instances.is_empty() {
            return ShardingPlan::new();
        }
        let offset = java_string_hash(job_name).unsigned_abs() as usize % instances.len();
        let mut rotated = instances.to_vec();
        rotated.rotate_left(offset);
        AverageAllocationStrategy::allocate(&rotated, total)
            .into_iter()
            .collect()
    }

    fn name(&self) -> &'static str {
        ShardingStrategyType::RoundRobin.as_str()
    }
}
