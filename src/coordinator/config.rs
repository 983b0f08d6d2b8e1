//! Job configuration stored in the registry
//!
//! The configuration lives as one JSON document at `/<job>/config`. It is
//! replaced atomically, never merged field by field. Every instance keeps a
//! local copy that the config listener refreshes on change events.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{JobConfig, JobType};
use crate::error::{Error, Result};
use crate::node::path::CONFIG_NODE;
use crate::node::JobNodeStorage;

/// Loads and persists the configuration of one job
#[derive(Clone)]
pub struct ConfigurationService {
    storage: JobNodeStorage,
    cache: Arc<RwLock<Option<JobConfig>>>,
}

impl ConfigurationService {
    pub fn new(storage: JobNodeStorage) -> Self {
        Self {
            storage,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Read the job configuration.
    ///
    /// With `from_cache` the last known value is returned without a registry
    /// round trip when one exists. A missing node is `JobNotRegistered`.
    pub async fn load(&self, from_cache: bool) -> Result<JobConfig> {
        if from_cache {
            if let Some(config) = self.cache.read().await.clone() {
                return Ok(config);
            }
        }

        let data = self
            .storage
            .get_job_node_data_directly(CONFIG_NODE)
            .await?
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::job_not_registered(self.storage.job_name()))?;
        let config = JobConfig::from_json(&data)?;

        *self.cache.write().await = Some(config.clone());
        Ok(config)
    }

    /// Bootstrap the job configuration.
    ///
    /// No stored config: persist `local`. Stored and `local.overwrite`: replace
    /// it. Otherwise the stored config wins and is returned unchanged. A stored
    /// config of another job type is a conflict either way.
    pub async fn set_up(&self, job_type: JobType, local: &JobConfig) -> Result<JobConfig> {
        local.validate()?;

        let stored = match self.load(false).await {
            Ok(config) => Some(config),
            Err(Error::JobNotRegistered { .. }) => None,
            Err(e) => return Err(e),
        };

        match stored {
            Some(stored) if stored.job_type != job_type => Err(Error::JobConflict {
                job_name: local.job_name.clone(),
                stored: stored.job_type.to_string(),
                local: job_type.to_string(),
            }),
            Some(_) if local.overwrite => {
                info!(job = %local.job_name, "Overwriting job configuration in registry");
                self.persist(local).await?;
                Ok(local.clone())
            }
            Some(stored) => {
                debug!(job = %local.job_name, "Using job configuration from registry");
                Ok(stored)
            }
            None => {
                info!(job = %local.job_name, "Registering job configuration");
                self.persist(local).await?;
                Ok(local.clone())
            }
        }
    }

    /// Replace the stored configuration (operator action)
    pub async fn persist(&self, config: &JobConfig) -> Result<()> {
        config.validate()?;
        self.storage
            .fill_job_node(CONFIG_NODE, &config.to_json()?)
            .await?;
        *self.cache.write().await = Some(config.clone());
        Ok(())
    }

    /// Last known configuration without touching the registry
    pub async fn cached(&self) -> Option<JobConfig> {
        self.cache.read().await.clone()
    }

    /// Install a configuration observed through a change event
    pub async fn refresh_cache(&self, config: JobConfig) {
        *self.cache.write().await = Some(config);
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }
}
