//! Server nodes
//!
//! One persistent node per server ip under `/<job>/servers`. The value is
//! `DISABLED` when an operator took the server out of rotation, empty
//! otherwise. Instances on a disabled server stay online but receive no
//! sharding items.

use tracing::info;

use crate::error::Result;
use crate::models::JobInstance;
use crate::node::path::{INSTANCES_NODE, SERVERS_NODE};
use crate::node::JobNodeStorage;

/// Value of a disabled server node
pub const SERVER_DISABLED: &str = "DISABLED";

/// Manages the server nodes of one job
#[derive(Clone)]
pub struct ServerService {
    storage: JobNodeStorage,
    server_ip: String,
}

impl ServerService {
    pub fn new(storage: JobNodeStorage, server_ip: impl Into<String>) -> Self {
        Self {
            storage,
            server_ip: server_ip.into(),
        }
    }

    pub fn server_ip(&self) -> &str {
        &self.server_ip
    }

    /// Create the local server node unless this server is already known
    pub async fn persist_online(&self, enabled: bool) -> Result<()> {
        let node = self.storage.path().server_node(&self.server_ip);
        if !self.storage.is_job_node_existed(&node).await? {
            let value = if enabled { "" } else { SERVER_DISABLED };
            self.storage.fill_job_node(&node, value).await?;
        }
        Ok(())
    }

    /// A server is enabled unless its node says `DISABLED`
    pub async fn is_enable_server(&self, server_ip: &str) -> Result<bool> {
        let node = self.storage.path().server_node(server_ip);
        let value = self.storage.get_job_node_data(&node).await?;
        Ok(value.as_deref() != Some(SERVER_DISABLED))
    }

    /// Take a server out of rotation (operator action)
    pub async fn disable_server(&self, server_ip: &str) -> Result<()> {
        info!(job = %self.storage.job_name(), server = %server_ip, "Disabling server");
        let node = self.storage.path().server_node(server_ip);
        self.storage.fill_job_node(&node, SERVER_DISABLED).await?;
        Ok(())
    }

    /// Put a server back into rotation (operator action)
    pub async fn enable_server(&self, server_ip: &str) -> Result<()> {
        info!(job = %self.storage.job_name(), server = %server_ip, "Enabling server");
        let node = self.storage.path().server_node(server_ip);
        self.storage.fill_job_node(&node, "").await?;
        Ok(())
    }

    /// Every known server ip
    pub async fn get_all_servers(&self) -> Result<Vec<String>> {
        Ok(self.storage.get_job_node_children_keys(SERVERS_NODE).await?)
    }

    /// Enabled and hosting at least one online instance
    pub async fn is_available_server(&self, server_ip: &str) -> Result<bool> {
        if !self.is_enable_server(server_ip).await? {
            return Ok(false);
        }
        Ok(self
            .storage
            .get_job_node_children_keys(INSTANCES_NODE)
            .await?
            .into_iter()
            .any(|id| JobInstance::from_id(id).server_ip() == server_ip))
    }

    /// Whether any server could take the leadership
    pub async fn has_available_servers(&self) -> Result<bool> {
        for server_ip in self.get_all_servers().await? {
            if self.is_available_server(&server_ip).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
