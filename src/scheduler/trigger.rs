//! Trigger requests for the external scheduler
//!
//! The cron mechanism lives outside this crate. When coordination decides
//! that items must run outside the regular schedule (a claimed failover, a
//! misfire catch-up) it publishes a [`TriggerEvent`]; the scheduler
//! subscribes and calls `JobCoordinator::execute` again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of the trigger channel
const DEFAULT_TRIGGER_CAPACITY: usize = 64;

/// Request to run items outside the regular schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEvent {
    /// Items of a crashed instance were claimed and should run now
    FailoverClaimed {
        job_name: String,
        items: Vec<u32>,
        at: DateTime<Utc>,
    },

    /// Misfired items ran their single catch-up execution
    MisfireCatchUp {
        job_name: String,
        items: Vec<u32>,
        at: DateTime<Utc>,
    },
}

impl TriggerEvent {
    pub fn failover_claimed(job_name: impl Into<String>, items: Vec<u32>) -> Self {
        Self::FailoverClaimed {
            job_name: job_name.into(),
            items,
            at: Utc::now(),
        }
    }

    pub fn misfire_catch_up(job_name: impl Into<String>, items: Vec<u32>) -> Self {
        Self::MisfireCatchUp {
            job_name: job_name.into(),
            items,
            at: Utc::now(),
        }
    }

    pub fn job_name(&self) -> &str {
        match self {
            Self::FailoverClaimed { job_name, .. } | Self::MisfireCatchUp { job_name, .. } => {
                job_name
            }
        }
    }
}

/// Broadcast channel of trigger requests
#[derive(Clone)]
pub struct TriggerBus {
    tx: broadcast::Sender<TriggerEvent>,
}

impl TriggerBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TRIGGER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns the number of subscribers that received it
    pub fn publish(&self, event: TriggerEvent) -> usize {
        debug!(job = %event.job_name(), event = ?event, "Publishing trigger event");
        // No subscribers is fine
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for TriggerBus {
    fn default() -> Self {
        Self::new()
    }
}
