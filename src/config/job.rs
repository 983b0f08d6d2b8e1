//! Job configuration
//!
//! A single flat [`JobConfig`] describes a job for every job type; settings
//! specific to a job type live in the opaque `props` bag. The configuration is
//! stored as one JSON document at `/<job>/config` and always replaced as a
//! whole.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::scheduler::strategy::ShardingStrategyType;

/// Property holding the command line of a script job
pub const SCRIPT_COMMAND_LINE_KEY: &str = "script.command.line";

// ============================================================================
// Job Type
// ============================================================================

/// Kind of business logic the job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    #[default]
    Simple,
    Dataflow,
    Script,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "SIMPLE",
            Self::Dataflow => "DATAFLOW",
            Self::Script => "SCRIPT",
        }
    }

    /// Parse a job type name, case-insensitively
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(Self::Simple),
            "DATAFLOW" => Ok(Self::Dataflow),
            "SCRIPT" => Ok(Self::Script),
            _ => Err(Error::config(
                "job_type",
                format!("Unknown job type '{}'. Valid options: SIMPLE, DATAFLOW, SCRIPT", name),
            )),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Configuration
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_reconcile_minutes() -> u32 {
    10
}

/// Configuration of one sharded job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub job_name: String,

    #[serde(default)]
    pub job_type: JobType,

    /// Cron expression evaluated by the external trigger
    pub cron: String,

    /// Number of sharding items, always positive
    pub sharding_total_count: u32,

    /// Per-item parameters, e.g. `0=Beijing,1=Shanghai`
    #[serde(default)]
    pub sharding_item_parameters: String,

    #[serde(default)]
    pub job_parameter: String,

    /// Re-execute items of crashed instances
    #[serde(default)]
    pub failover: bool,

    /// Catch up once on triggers that fired while items were running
    #[serde(default = "default_true")]
    pub misfire: bool,

    /// Track running items in the registry
    #[serde(default = "default_true")]
    pub monitor_execution: bool,

    /// Interval of the assignment reconcile pass, 0 to disable
    #[serde(default = "default_reconcile_minutes")]
    pub reconcile_interval_minutes: u32,

    /// Sharding strategy name, empty for average allocation
    #[serde(default)]
    pub job_sharding_strategy_type: String,

    #[serde(default)]
    pub description: String,

    /// Start the servers of this process disabled
    #[serde(default)]
    pub disabled: bool,

    /// Replace the stored configuration on start up
    #[serde(default)]
    pub overwrite: bool,

    /// Job-type specific properties
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl JobConfig {
    /// Start building a configuration
    pub fn builder(
        job_name: impl Into<String>,
        cron: impl Into<String>,
        sharding_total_count: u32,
    ) -> JobConfigBuilder {
        JobConfigBuilder::new(job_name, cron, sharding_total_count)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(Error::config("job_name", "Job name cannot be empty"));
        }
        if self.job_name.contains('/') {
            return Err(Error::config("job_name", "Job name cannot contain '/'"));
        }
        if self.cron.trim().is_empty() {
            return Err(Error::config("cron", "Cron expression cannot be empty"));
        }
        if self.sharding_total_count == 0 {
            return Err(Error::config(
                "sharding_total_count",
                "Sharding total count must be greater than 0",
            ));
        }

        ShardingItemParameters::parse(&self.sharding_item_parameters, self.sharding_total_count)?;
        ShardingStrategyType::parse(&self.job_sharding_strategy_type)?;

        if self.job_type == JobType::Script
            && self
                .props
                .get(SCRIPT_COMMAND_LINE_KEY)
                .map_or(true, |v| v.trim().is_empty())
        {
            return Err(Error::config(
                SCRIPT_COMMAND_LINE_KEY,
                "Script jobs require a command line",
            ));
        }

        Ok(())
    }

    /// Parsed per-item parameters
    pub fn item_parameters(&self) -> Result<BTreeMap<u32, String>> {
        ShardingItemParameters::parse(&self.sharding_item_parameters, self.sharding_total_count)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize and validate a stored configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`JobConfig`]
#[derive(Debug, Clone)]
pub struct JobConfigBuilder {
    config: JobConfig,
}

impl JobConfigBuilder {
    fn new(job_name: impl Into<String>, cron: impl Into<String>, sharding_total_count: u32) -> Self {
        Self {
            config: JobConfig {
                job_name: job_name.into(),
                job_type: JobType::Simple,
                cron: cron.into(),
                sharding_total_count,
                sharding_item_parameters: String::new(),
                job_parameter: String::new(),
                failover: false,
                misfire: true,
                monitor_execution: true,
                reconcile_interval_minutes: default_reconcile_minutes(),
                job_sharding_strategy_type: String::new(),
                description: String::new(),
                disabled: false,
                overwrite: false,
                props: BTreeMap::new(),
            },
        }
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.config.job_type = job_type;
        self
    }

    pub fn sharding_item_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.config.sharding_item_parameters = parameters.into();
        self
    }

    pub fn job_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.config.job_parameter = parameter.into();
        self
    }

    pub fn failover(mut self, enabled: bool) -> Self {
        self.config.failover = enabled;
        self
    }

    pub fn misfire(mut self, enabled: bool) -> Self {
        self.config.misfire = enabled;
        self
    }

    pub fn monitor_execution(mut self, enabled: bool) -> Self {
        self.config.monitor_execution = enabled;
        self
    }

    pub fn reconcile_interval_minutes(mut self, minutes: u32) -> Self {
        self.config.reconcile_interval_minutes = minutes;
        self
    }

    pub fn job_sharding_strategy_type(mut self, strategy: impl Into<String>) -> Self {
        self.config.job_sharding_strategy_type = strategy.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = description.into();
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.config.disabled = disabled;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.config.overwrite = overwrite;
        self
    }

    /// Set one job-type property
    pub fn prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.props.insert(key.into(), value.into());
        self
    }

    /// Build and validate the config
    pub fn build(self) -> Result<JobConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ============================================================================
// Sharding Item Parameters
// ============================================================================

/// Parser for `item=parameter` lists
pub struct ShardingItemParameters;

impl ShardingItemParameters {
    /// Parse `0=a,1=b` into an item to parameter map.
    ///
    /// Items must be below `total`; an empty string yields an empty map.
    pub fn parse(value: &str, total: u32) -> Result<BTreeMap<u32, String>> {
        let mut parameters = BTreeMap::new();
        for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (item, parameter) = pair.split_once('=').ok_or_else(|| {
                Error::config(
                    "sharding_item_parameters",
                    format!("'{}' is not in 'item=parameter' format", pair),
                )
            })?;
            let item: u32 = item.trim().parse().map_err(|_| {
                Error::config(
                    "sharding_item_parameters",
                    format!("'{}' is not a sharding item", item.trim()),
                )
            })?;
            if item >= total {
                return Err(Error::InvalidShardingItem { item, total });
            }
            parameters.insert(item, parameter.trim().to_string());
        }
        Ok(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = JobConfig::builder("order_job", "0/5 * * * * ?", 3)
            .build()
            .unwrap();

        assert_eq!(config.job_type, JobType::Simple);
        assert!(config.misfire);
        assert!(config.monitor_execution);
        assert!(!config.failover);
    }

    #[test]
    fn test_zero_sharding_count_rejected() {
        let result = JobConfig::builder("job", "* * * * * ?", 0).build();
        assert!(matches!(result, Err(Error::Config { ref field, .. }) if field == "sharding_total_count"));
    }

    #[test]
    fn test_empty_cron_rejected() {
        assert!(JobConfig::builder("job", " ", 1).build().is_err());
    }

    #[test]
    fn test_job_name_with_slash_rejected() {
        assert!(JobConfig::builder("a/b", "* * * * * ?", 1).build().is_err());
    }

    #[test]
    fn test_script_job_requires_command_line() {
        let result = JobConfig::builder("script_job", "* * * * * ?", 1)
            .job_type(JobType::Script)
            .build();
        assert!(result.is_err());

        let config = JobConfig::builder("script_job", "* * * * * ?", 1)
            .job_type(JobType::Script)
            .prop(SCRIPT_COMMAND_LINE_KEY, "/opt/run.sh")
            .build()
            .unwrap();
        assert_eq!(config.props[SCRIPT_COMMAND_LINE_KEY], "/opt/run.sh");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result = JobConfig::builder("job", "* * * * * ?", 2)
            .job_sharding_strategy_type("NO_SUCH")
            .build();
        assert!(matches!(result, Err(Error::UnknownStrategy(_))));
    }

    #[test]
    fn test_json_round_trip_uses_camel_case() {
        let config = JobConfig::builder("job", "* * * * * ?", 4)
            .failover(true)
            .build()
            .unwrap();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"shardingTotalCount\":4"));
        assert_eq!(JobConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config =
            JobConfig::from_json(r#"{"jobName":"job","cron":"* * * * * ?","shardingTotalCount":2}"#)
                .unwrap();
        assert!(config.misfire);
        assert_eq!(config.reconcile_interval_minutes, 10);
    }

    #[test]
    fn test_from_json_rejects_invalid_count() {
        let result =
            JobConfig::from_json(r#"{"jobName":"job","cron":"* * * * * ?","shardingTotalCount":0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_item_parameters() {
        let parsed = ShardingItemParameters::parse("0=Beijing, 1=Shanghai ,2=", 3).unwrap();
        assert_eq!(parsed[&0], "Beijing");
        assert_eq!(parsed[&1], "Shanghai");
        assert_eq!(parsed[&2], "");

        assert!(ShardingItemParameters::parse("", 3).unwrap().is_empty());
    }

    #[test]
    fn test_parse_item_parameters_errors() {
        assert!(ShardingItemParameters::parse("0", 3).is_err());
        assert!(ShardingItemParameters::parse("x=1", 3).is_err());
        assert!(matches!(
            ShardingItemParameters::parse("5=a", 3),
            Err(Error::InvalidShardingItem { item: 5, total: 3 })
        ));
    }

    #[test]
    fn test_job_type_parse() {
        assert_eq!(JobType::parse("dataflow").unwrap(), JobType::Dataflow);
        assert!(JobType::parse("cron").is_err());
    }
}
