//! Instance registration
//!
//! Each process registers an ephemeral node `/<job>/instances/<ip@-@pid>`
//! whose value is the server ip. The registry drops the node when the
//! session ends, which is how peers notice a crash.

use tracing::info;

use super::server::ServerService;
use crate::error::Result;
use crate::models::JobInstance;
use crate::node::path::INSTANCES_NODE;
use crate::node::JobNodeStorage;

/// Registers the local instance and lists its peers
#[derive(Clone)]
pub struct InstanceService {
    storage: JobNodeStorage,
    server: ServerService,
    instance: JobInstance,
}

impl InstanceService {
    pub fn new(storage: JobNodeStorage, server: ServerService, instance: JobInstance) -> Self {
        Self {
            storage,
            server,
            instance,
        }
    }

    pub fn local_instance(&self) -> &JobInstance {
        &self.instance
    }

    /// Register the local ephemeral instance node
    pub async fn persist_online(&self) -> Result<()> {
        let node = self.storage.path().instance_node(self.instance.id());
        self.storage
            .fill_ephemeral_job_node(&node, self.instance.server_ip())
            .await?;
        info!(
            job = %self.storage.job_name(),
            instance = %self.instance,
            "Instance online"
        );
        Ok(())
    }

    /// Remove the local instance node (graceful shutdown)
    pub async fn remove_instance(&self) -> Result<()> {
        let node = self.storage.path().instance_node(self.instance.id());
        self.storage.remove_job_node_if_existed(&node).await?;
        Ok(())
    }

    pub async fn is_local_job_instance_existed(&self) -> Result<bool> {
        let node = self.storage.path().instance_node(self.instance.id());
        Ok(self.storage.is_job_node_existed(&node).await?)
    }

    /// Every online instance, sorted by id
    pub async fn get_all_job_instances(&self) -> Result<Vec<JobInstance>> {
        let mut instances: Vec<JobInstance> = self
            .storage
            .get_job_node_children_keys(INSTANCES_NODE)
            .await?
            .into_iter()
            .map(JobInstance::from_id)
            .collect();
        instances.sort();
        Ok(instances)
    }

    /// Online instances whose server is enabled, sorted by id
    pub async fn get_available_job_instances(&self) -> Result<Vec<JobInstance>> {
        let mut available = Vec::new();
        for instance in self.get_all_job_instances().await? {
            if self.server.is_enable_server(instance.server_ip()).await? {
                available.push(instance);
            }
        }
        Ok(available)
    }

    /// Whether an instance is online on an enabled server
    pub async fn is_available(&self, instance: &JobInstance) -> Result<bool> {
        let node = self.storage.path().instance_node(instance.id());
        Ok(self.storage.is_job_node_existed(&node).await?
            && self.server.is_enable_server(instance.server_ip()).await?)
    }
}
