use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobshard::config::{EngineConfig, JobConfig};
use jobshard::registry::{MemoryRegistry, MemoryRegistryClient};
use jobshard::scheduler::{
    CycleReport, JobCoordinator, ShardedJob, ShardingStrategyType, TriggerEvent,
};
use jobshard::{ExecutionSource, JobInstance, ShardingContext};

#[derive(Parser)]
#[command(
    name = "jobshard",
    version,
    about = "Sharded job coordination: inspect sharding plans and simulate fleets",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the item assignment a strategy produces
    Plan {
        /// Job name (ODEVITY and ROUND_ROBIN depend on it)
        #[arg(short, long, default_value = "job")]
        job: String,

        /// Sharding strategy (AVG_ALLOCATION, ODEVITY, ROUND_ROBIN)
        #[arg(short, long, default_value = "AVG_ALLOCATION")]
        strategy: String,

        /// Sharding total count
        #[arg(short, long)]
        total: u32,

        /// Instance ids (ip@-@pid) or plain ips, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        instances: Vec<String>,

        /// Print the plan as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Run an in-memory fleet, crash one instance and show the recovery
    Simulate {
        /// Job name
        #[arg(short, long, default_value = "job")]
        job: String,

        /// Number of instances
        #[arg(short = 'n', long, default_value = "3")]
        instances: usize,

        /// Sharding total count
        #[arg(short, long, default_value = "9")]
        total: u32,

        /// Index of the instance to crash mid-execution
        #[arg(short, long, default_value = "0")]
        crash: usize,

        /// Sharding strategy
        #[arg(short, long, default_value = "AVG_ALLOCATION")]
        strategy: String,

        /// Engine configuration file (TOML)
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    match cli.command {
        Commands::Plan {
            job,
            strategy,
            total,
            instances,
            json,
        } => {
            tracing::debug!(
                job = %job,
                strategy = %strategy,
                total = %total,
                "Starting plan command"
            );
            plan(&job, &strategy, total, &instances, json)?;
        }

        Commands::Simulate {
            job,
            instances,
            total,
            crash,
            strategy,
            config,
        } => {
            tracing::info!(
                job = %job,
                instances = %instances,
                total = %total,
                crash = %crash,
                "Starting simulate command"
            );
            simulate(&job, instances, total, crash, &strategy, config.as_deref()).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("jobshard=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("jobshard=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        }
    }

    Ok(())
}

fn plan(job: &str, strategy: &str, total: u32, instances: &[String], json: bool) -> Result<()> {
    let strategy = ShardingStrategyType::parse(strategy)?;
    let mut instances: Vec<JobInstance> = instances
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            if raw.contains(jobshard::models::INSTANCE_DELIMITER) {
                JobInstance::from_id(raw)
            } else {
                JobInstance::new(raw, i as u32 + 1)
            }
        })
        .collect();
    instances.sort();
    let plan = strategy.strategy().sharding(&instances, job, total);

    if json {
        let view: BTreeMap<String, &Vec<u32>> =
            plan.iter().map(|(k, v)| (k.id().to_string(), v)).collect();
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("{} items of '{}' with {}:", total, job, strategy);
    for (instance, items) in &plan {
        println!("  {:<28} {:?}", instance.id(), items);
    }
    Ok(())
}

/// Logs each item and stays in flight while `hold` is set
struct SimulatedJob {
    hold: Option<Arc<Notify>>,
}

#[async_trait]
impl ShardedJob for SimulatedJob {
    async fn execute(&self, ctx: &ShardingContext, item: u32) -> anyhow::Result<()> {
        tracing::debug!(
            job = %ctx.job_name,
            item,
            source = %ctx.execution_source,
            "Simulated item running"
        );
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        Ok(())
    }
}

struct SimulatedNode {
    session: Arc<MemoryRegistryClient>,
    coordinator: Arc<JobCoordinator>,
}

async fn simulate(
    job: &str,
    instances: usize,
    total: u32,
    crash: usize,
    strategy: &str,
    config: Option<&str>,
) -> Result<()> {
    anyhow::ensure!(instances >= 2, "simulate needs at least two instances");
    anyhow::ensure!(crash < instances, "crash index {} out of range", crash);

    let engine = match config {
        Some(path) => EngineConfig::from_file(Path::new(path))?,
        None => EngineConfig::default(),
    };
    let job_config = JobConfig::builder(job, "0 * * * * ?", total)
        .failover(true)
        .misfire(true)
        .job_sharding_strategy_type(strategy)
        .build()?;

    let registry = MemoryRegistry::new();
    let mut nodes = Vec::with_capacity(instances);
    for i in 0..instances {
        let session = Arc::new(registry.connect().await);
        let instance = JobInstance::new(&format!("10.0.0.{}", i + 1), 1000 + i as u32);
        let coordinator = Arc::new(JobCoordinator::with_instance(
            session.clone(),
            job_config.clone(),
            instance,
            &engine,
        )?);
        coordinator.register_start_up().await?;
        nodes.push(SimulatedNode {
            session,
            coordinator,
        });
    }

    settle().await;
    println!("== initial cycle");
    let all: Vec<&SimulatedNode> = nodes.iter().collect();
    for (id, report) in run_cycle(&all).await? {
        println!("  {:<28} ran {:?}", id, report.items_for(ExecutionSource::NormalTrigger));
    }

    let victim = &nodes[crash];
    let victim_items = victim.coordinator.services().sharding.get_local_sharding_items().await?;
    let hold = Arc::new(Notify::new());
    let in_flight = {
        let coordinator = Arc::clone(&victim.coordinator);
        let job = SimulatedJob {
            hold: Some(Arc::clone(&hold)),
        };
        tokio::spawn(async move { coordinator.execute(&job).await })
    };
    wait_for_running(&victim.coordinator, &victim_items).await?;

    println!(
        "== crashing {} while it runs {:?}",
        victim.coordinator.local_instance().id(),
        victim_items
    );
    in_flight.abort();
    victim.session.close().await;
    settle().await;

    let survivors: Vec<&SimulatedNode> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != crash)
        .map(|(_, n)| n)
        .collect();
    let mut triggers: Vec<_> = survivors
        .iter()
        .map(|n| n.coordinator.subscribe_triggers())
        .collect();

    println!("== recovery cycle");
    for (id, report) in run_cycle(&survivors).await? {
        println!(
            "  {:<28} ran {:?} claimed {:?}",
            id,
            report.items_for(ExecutionSource::NormalTrigger),
            report.failover_claimed
        );
    }

    println!("== failover triggers");
    for (node, rx) in survivors.iter().zip(triggers.iter_mut()) {
        while let Ok(event) = rx.try_recv() {
            if let TriggerEvent::FailoverClaimed { items, .. } = event {
                let report = node.coordinator.execute(&SimulatedJob { hold: None }).await?;
                println!(
                    "  {:<28} claimed {:?} ran {:?}",
                    node.coordinator.local_instance().id(),
                    items,
                    report.items_for(ExecutionSource::Failover)
                );
            }
        }
    }

    println!("== final assignment");
    for node in &survivors {
        let items = node.coordinator.services().sharding.get_local_sharding_items().await?;
        println!("  {:<28} {:?}", node.coordinator.local_instance().id(), items);
    }

    for node in &survivors {
        node.coordinator.shutdown().await?;
    }
    Ok(())
}

/// Let listeners drain the registry events of the last membership change
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Fire one trigger on every node at once, as a shared cron schedule would
async fn run_cycle(nodes: &[&SimulatedNode]) -> Result<Vec<(String, CycleReport)>> {
    let job = SimulatedJob { hold: None };
    let reports = futures::future::join_all(nodes.iter().map(|n| n.coordinator.execute(&job))).await;
    let mut out = Vec::with_capacity(nodes.len());
    for (node, report) in nodes.iter().zip(reports) {
        out.push((node.coordinator.local_instance().id().to_string(), report?));
    }
    Ok(out)
}

async fn wait_for_running(coordinator: &JobCoordinator, items: &[u32]) -> Result<()> {
    for _ in 0..100 {
        if coordinator
            .services()
            .execution
            .has_running_items(items)
            .await
            .context("reading running markers")?
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("crash victim never started running {:?}", items)
}
