//! Job-scoped access to the registry
//!
//! [`JobNodeStorage`] pairs a registry client with a [`JobNodePath`] so the
//! services can address nodes relative to their job root.

use std::sync::Arc;

use super::path::{JobNodePath, SHARDING_NODE};
use crate::registry::{DataWatch, RegistryCenter, RegistryResult};

/// Registry operations scoped to one job
#[derive(Clone)]
pub struct JobNodeStorage {
    registry: Arc<dyn RegistryCenter>,
    path: JobNodePath,
}

impl JobNodeStorage {
    pub fn new(registry: Arc<dyn RegistryCenter>, job_name: impl Into<String>) -> Self {
        Self {
            registry,
            path: JobNodePath::new(job_name),
        }
    }

    pub fn job_name(&self) -> &str {
        self.path.job_name()
    }

    pub fn path(&self) -> &JobNodePath {
        &self.path
    }

    pub fn registry(&self) -> &Arc<dyn RegistryCenter> {
        &self.registry
    }

    /// Check whether a job node exists
    pub async fn is_job_node_existed(&self, node: &str) -> RegistryResult<bool> {
        self.registry.is_existed(&self.path.full_path(node)).await
    }

    /// Read a job node, possibly cached by the client
    pub async fn get_job_node_data(&self, node: &str) -> RegistryResult<Option<String>> {
        self.registry.get(&self.path.full_path(node)).await
    }

    /// Read a job node straight from the registry
    pub async fn get_job_node_data_directly(&self, node: &str) -> RegistryResult<Option<String>> {
        self.registry.get_directly(&self.path.full_path(node)).await
    }

    pub async fn get_job_node_children_keys(&self, node: &str) -> RegistryResult<Vec<String>> {
        self.registry.get_children_keys(&self.path.full_path(node)).await
    }

    /// Numeric children of `sharding`, ascending
    pub async fn get_sharding_item_keys(&self) -> RegistryResult<Vec<u32>> {
        let mut items: Vec<u32> = self
            .get_job_node_children_keys(SHARDING_NODE)
            .await?
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        items.sort_unstable();
        Ok(items)
    }

    /// Create an empty persistent node unless one exists
    pub async fn create_job_node_if_needed(&self, node: &str) -> RegistryResult<()> {
        let key = self.path.full_path(node);
        if !self.registry.is_existed(&key).await? {
            self.registry.persist(&key, "").await?;
        }
        Ok(())
    }

    pub async fn remove_job_node_if_existed(&self, node: &str) -> RegistryResult<()> {
        let key = self.path.full_path(node);
        if self.registry.is_existed(&key).await? {
            self.registry.remove(&key).await?;
        }
        Ok(())
    }

    /// Create or overwrite a persistent node
    pub async fn fill_job_node(&self, node: &str, value: &str) -> RegistryResult<()> {
        self.registry.persist(&self.path.full_path(node), value).await
    }

    /// Create or replace an ephemeral node owned by this session
    pub async fn fill_ephemeral_job_node(&self, node: &str, value: &str) -> RegistryResult<()> {
        self.registry
            .persist_ephemeral(&self.path.full_path(node), value)
            .await
    }

    /// Overwrite an existing node
    pub async fn update_job_node(&self, node: &str, value: &str) -> RegistryResult<()> {
        self.registry.update(&self.path.full_path(node), value).await
    }

    /// Write a node only if its value differs. Returns whether a write happened.
    pub async fn replace_job_node_if_changed(&self, node: &str, value: &str) -> RegistryResult<bool> {
        let key = self.path.full_path(node);
        match self.registry.get_directly(&key).await? {
            Some(current) if current == value => Ok(false),
            _ => {
                self.registry.persist(&key, value).await?;
                Ok(true)
            }
        }
    }

    /// Create an ephemeral-sequential child and return its full path
    pub async fn fill_ephemeral_sequential_job_node(
        &self,
        node: &str,
        value: &str,
    ) -> RegistryResult<String> {
        self.registry
            .persist_ephemeral_sequential(&self.path.full_path(node), value)
            .await
    }

    /// Watch the whole job subtree
    pub fn watch_job(&self) -> DataWatch {
        self.registry.watch(&self.path.root())
    }
}
