//! Common test utilities: an in-memory fleet of job coordinators

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};

use jobshard::config::{EngineConfig, JobConfig};
use jobshard::registry::{MemoryRegistry, MemoryRegistryClient, RegistryCenter};
use jobshard::scheduler::{CycleReport, JobCoordinator, ShardedJob};
use jobshard::{ExecutionSource, JobInstance, ShardingContext};

/// Engine settings with short polls and timeouts
pub fn fast_engine() -> EngineConfig {
    let mut engine = EngineConfig::default();
    engine.coordination.poll_interval_ms = 1;
    engine.coordination.max_poll_interval_ms = 10;
    engine.coordination.sharding_wait_timeout_ms = 2_000;
    engine.coordination.leader_wait_timeout_ms = 2_000;
    engine.coordination.bootstrap_retries = 1;
    engine
}

/// Job with failover and misfire enabled
pub fn job_config(name: &str, total: u32) -> JobConfig {
    JobConfig::builder(name, "0 * * * * ?", total)
        .failover(true)
        .misfire(true)
        .build()
        .unwrap()
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Let listeners drain pending registry events
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// One process of the fleet
pub struct Node {
    pub session: Arc<MemoryRegistryClient>,
    pub coordinator: Arc<JobCoordinator>,
}

impl Node {
    pub fn id(&self) -> &str {
        self.coordinator.local_instance().id()
    }
}

/// Fleet of coordinators sharing one in-memory registry
pub struct Cluster {
    pub registry: MemoryRegistry,
    pub engine: EngineConfig,
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            registry: MemoryRegistry::new(),
            engine: fast_engine(),
            nodes: Vec::new(),
        }
    }

    /// Register a node at `10.0.0.<n>` with pid `n`; returns its index
    pub async fn start_node(&mut self, n: u32, job: JobConfig) -> usize {
        let session = Arc::new(self.registry.connect().await);
        let instance = JobInstance::new(&format!("10.0.0.{}", n), n);
        let coordinator =
            JobCoordinator::with_instance(session.clone(), job, instance, &self.engine).unwrap();
        coordinator.register_start_up().await.unwrap();
        self.nodes.push(Node {
            session,
            coordinator: Arc::new(coordinator),
        });
        self.nodes.len() - 1
    }

    /// Start `count` nodes running `job`
    pub async fn start(count: u32, job: JobConfig) -> Self {
        let mut cluster = Self::new();
        for n in 1..=count {
            cluster.start_node(n, job.clone()).await;
        }
        settle().await;
        cluster
    }

    /// Drop a node's session as a crash would
    pub async fn crash(&self, index: usize) {
        self.nodes[index].session.close().await;
    }

    /// Fire one trigger on the given nodes at the same time
    pub async fn run_cycle(&self, indexes: &[usize], job: &dyn ShardedJob) -> Vec<CycleReport> {
        let reports = futures::future::join_all(
            indexes
                .iter()
                .map(|&i| self.nodes[i].coordinator.execute(job)),
        )
        .await;
        reports.into_iter().map(|r| r.unwrap()).collect()
    }

    /// Current `item -> instance id` assignment read straight from the registry
    pub async fn assignment(&self, job: &str) -> BTreeMap<u32, String> {
        let prefix = format!("/{}/sharding", job);
        self.registry
            .dump(&prefix)
            .await
            .into_iter()
            .filter_map(|(path, value)| {
                let rest = path.strip_prefix(&prefix)?.strip_prefix('/')?;
                let (item, leaf) = rest.split_once('/')?;
                (leaf == "instance").then(|| (item.parse().ok(), value))
            })
            .filter_map(|(item, value)| item.map(|i| (i, value)))
            .collect()
    }

    /// Items per instance id, from the registry
    pub async fn items_by_instance(&self, job: &str) -> BTreeMap<String, Vec<u32>> {
        let mut by_instance: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (item, instance) in self.assignment(job).await {
            by_instance.entry(instance).or_default().push(item);
        }
        by_instance
    }

    /// Whether `path` exists, read through a fresh session
    pub async fn exists(&self, path: &str) -> bool {
        let observer = self.registry.connect().await;
        let existed = observer.is_existed(path).await.unwrap();
        observer.close().await;
        existed
    }
}

/// Records every item it runs
#[derive(Default)]
pub struct RecordingJob {
    pub runs: Mutex<Vec<(ExecutionSource, u32)>>,
}

impl RecordingJob {
    pub async fn runs(&self) -> Vec<(ExecutionSource, u32)> {
        self.runs.lock().await.clone()
    }

    pub async fn items_from(&self, source: ExecutionSource) -> Vec<u32> {
        let mut items: Vec<u32> = self
            .runs
            .lock()
            .await
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, i)| *i)
            .collect();
        items.sort();
        items
    }
}

#[async_trait]
impl ShardedJob for RecordingJob {
    async fn execute(&self, ctx: &ShardingContext, item: u32) -> anyhow::Result<()> {
        self.runs.lock().await.push((ctx.execution_source, item));
        Ok(())
    }
}

/// Blocks every item until released
pub struct BlockingJob {
    pub started: Notify,
    release: Semaphore,
    pub runs: Mutex<Vec<(ExecutionSource, u32)>>,
}

impl BlockingJob {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            release: Semaphore::new(0),
            runs: Mutex::new(Vec::new()),
        })
    }

    /// Let every current and future item finish
    pub fn release(&self) {
        self.release.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl ShardedJob for BlockingJob {
    async fn execute(&self, ctx: &ShardingContext, item: u32) -> anyhow::Result<()> {
        self.runs.lock().await.push((ctx.execution_source, item));
        self.started.notify_one();
        let _permit = self.release.acquire().await?;
        Ok(())
    }
}
