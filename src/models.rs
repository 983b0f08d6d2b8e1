// Core data structures for jobshard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Separator between server ip and pid in an instance id
pub const INSTANCE_DELIMITER: &str = "@-@";

/// One running process of a job, identified as `serverIp@-@pid`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobInstance {
    pub job_instance_id: String,
}

impl JobInstance {
    /// Instance for this server and process
    pub fn new(server_ip: &str, pid: u32) -> Self {
        Self {
            job_instance_id: format!("{}{}{}", server_ip, INSTANCE_DELIMITER, pid),
        }
    }

    /// Wrap an instance id read from the registry
    pub fn from_id(job_instance_id: impl Into<String>) -> Self {
        Self {
            job_instance_id: job_instance_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.job_instance_id
    }

    /// Server ip part of the id (the whole id if it carries no delimiter)
    pub fn server_ip(&self) -> &str {
        self.job_instance_id
            .split_once(INSTANCE_DELIMITER)
            .map_or(self.job_instance_id.as_str(), |(ip, _)| ip)
    }

    /// Split the id into `(serverIp, pid)`
    pub fn parse(&self) -> Result<(String, u32)> {
        let (ip, pid) = self
            .job_instance_id
            .split_once(INSTANCE_DELIMITER)
            .ok_or_else(|| {
                Error::other(format!("Malformed instance id '{}'", self.job_instance_id))
            })?;
        let pid = pid.parse::<u32>().map_err(|e| {
            Error::with_source(format!("Malformed pid in instance id '{}'", self.job_instance_id), e)
        })?;
        Ok((ip.to_string(), pid))
    }
}

impl fmt::Display for JobInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.job_instance_id)
    }
}

/// Why a set of items is being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionSource {
    /// Regular trigger
    NormalTrigger,
    /// Catch-up run for items that misfired
    Misfire,
    /// Re-execution of items whose owner crashed
    Failover,
}

impl fmt::Display for ExecutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NormalTrigger => "NORMAL_TRIGGER",
            Self::Misfire => "MISFIRE",
            Self::Failover => "FAILOVER",
        };
        write!(f, "{}", name)
    }
}

/// Everything an execution needs to know about the items it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingContext {
    pub job_name: String,
    /// `job@-@items@-@source@-@instance@-@timestamp`
    pub task_id: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    /// Item to its sharding parameter (empty when none configured)
    pub sharding_item_parameters: BTreeMap<u32, String>,
    pub execution_source: ExecutionSource,
    pub created_at: DateTime<Utc>,
}

impl ShardingContext {
    pub fn new(
        job_name: impl Into<String>,
        sharding_total_count: u32,
        job_parameter: impl Into<String>,
        sharding_item_parameters: BTreeMap<u32, String>,
        execution_source: ExecutionSource,
        instance: &JobInstance,
    ) -> Self {
        let job_name = job_name.into();
        let created_at = Utc::now();
        let items: Vec<String> = sharding_item_parameters.keys().map(|i| i.to_string()).collect();
        let task_id = [
            job_name.as_str(),
            &items.join(","),
            &execution_source.to_string(),
            instance.id(),
            &created_at.timestamp_millis().to_string(),
        ]
        .join(INSTANCE_DELIMITER);

        Self {
            job_name,
            task_id,
            sharding_total_count,
            job_parameter: job_parameter.into(),
            sharding_item_parameters,
            execution_source,
            created_at,
        }
    }

    /// Items covered by this context, ascending
    pub fn sharding_items(&self) -> Vec<u32> {
        self.sharding_item_parameters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sharding_item_parameters.is_empty()
    }
}
