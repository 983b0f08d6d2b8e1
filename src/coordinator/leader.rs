//! Leader election
//!
//! Every instance creates an ephemeral-sequential latch node under
//! `/<job>/leader/election/latch` carrying its instance id. The holder of the
//! lowest sequence is the leader and the only instance that writes sharding
//! assignments. When the leader's session ends its latch vanishes and the
//! next-lowest holder becomes leader without any further writes.
//!
//! Only an available server (enabled, with an online instance) takes part.
//! An instance whose server is disabled gives its latch up.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::server::ServerService;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::JobInstance;
use crate::node::path::LEADER_LATCH_NODE;
use crate::node::JobNodeStorage;
use crate::utils::retry::{wait_until, RetryConfig};

/// Leadership primitive the sharding logic depends on
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Join the election; returns whether this instance now leads
    async fn try_acquire_leadership(&self) -> Result<bool>;

    async fn is_leader(&self) -> Result<bool>;

    /// Leave the election so the next candidate takes over
    async fn release_leadership(&self) -> Result<()>;
}

/// Latch-based leader election for one job
#[derive(Clone)]
pub struct LeaderService {
    storage: JobNodeStorage,
    server: ServerService,
    instance: JobInstance,
    /// Full path of the latch node held by this instance
    latch: Arc<Mutex<Option<String>>>,
    poll: RetryConfig,
    wait_timeout: Duration,
}

impl LeaderService {
    pub fn new(
        storage: JobNodeStorage,
        server: ServerService,
        instance: JobInstance,
        poll: RetryConfig,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            server,
            instance,
            latch: Arc::new(Mutex::new(None)),
            poll,
            wait_timeout,
        }
    }

    pub fn local_instance(&self) -> &JobInstance {
        &self.instance
    }

    /// Create a latch node unless this instance still holds one.
    ///
    /// An unavailable local server leaves the election instead.
    pub async fn elect_leader(&self) -> Result<bool> {
        if !self.server.is_available_server(self.instance.server_ip()).await? {
            debug!(
                job = %self.storage.job_name(),
                instance = %self.instance,
                "Local server unavailable, not joining leader election"
            );
            self.remove_leader().await?;
            return Ok(false);
        }

        let mut latch = self.latch.lock().await;
        let held = match latch.as_deref() {
            Some(path) => self.storage.registry().is_existed(path).await?,
            None => false,
        };
        if !held {
            let path = self
                .storage
                .fill_ephemeral_sequential_job_node(LEADER_LATCH_NODE, self.instance.id())
                .await?;
            debug!(job = %self.storage.job_name(), latch = %path, "Joined leader election");
            *latch = Some(path);
        }
        drop(latch);

        let leader = self.is_leader().await?;
        if leader {
            info!(
                job = %self.storage.job_name(),
                instance = %self.instance,
                "Elected leader"
            );
        }
        Ok(leader)
    }

    /// Instance id stored in the lowest latch node
    pub async fn leader_instance(&self) -> Result<Option<String>> {
        // Candidates may vanish between listing and reading
        for latch in self.storage.get_job_node_children_keys(LEADER_LATCH_NODE).await? {
            let node = format!("{}/{}", LEADER_LATCH_NODE, latch);
            if let Some(id) = self.storage.get_job_node_data_directly(&node).await? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub async fn is_leader(&self) -> Result<bool> {
        let leader = self.leader_instance().await?.as_deref() == Some(self.instance.id());
        metrics::set_leader(self.storage.job_name(), leader);
        Ok(leader)
    }

    pub async fn has_leader(&self) -> Result<bool> {
        Ok(self.leader_instance().await?.is_some())
    }

    /// Drop the local latch node so another instance takes over
    pub async fn remove_leader(&self) -> Result<()> {
        if let Some(path) = self.latch.lock().await.take() {
            self.storage.registry().remove(&path).await?;
            info!(job = %self.storage.job_name(), instance = %self.instance, "Left leader election");
        }
        metrics::set_leader(self.storage.job_name(), false);
        Ok(())
    }

    /// Wait until some instance leads, joining the election if nobody does.
    ///
    /// Stops waiting once no available server is left. Returns whether the
    /// local instance is the leader, or `LeaderElectionTimeout` when no
    /// leader shows up in time.
    pub async fn is_leader_until_block(&self) -> Result<bool> {
        let elected = wait_until(&self.poll, self.wait_timeout, || async move {
            if self.has_leader().await? || !self.server.has_available_servers().await? {
                return Ok(true);
            }
            self.elect_leader().await?;
            self.has_leader().await
        })
        .await?;

        if !elected {
            return Err(Error::LeaderElectionTimeout {
                job_name: self.storage.job_name().to_string(),
                waited_ms: self.wait_timeout.as_millis() as u64,
            });
        }
        self.is_leader().await
    }
}

#[async_trait]
impl LeaderElection for LeaderService {
    async fn try_acquire_leadership(&self) -> Result<bool> {
        self.elect_leader().await
    }

    async fn is_leader(&self) -> Result<bool> {
        LeaderService::is_leader(self).await
    }

    async fn release_leadership(&self) -> Result<()> {
        self.remove_leader().await
    }
}
