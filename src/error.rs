//! Unified error handling for the jobshard crate
//!
//! Domain-specific errors (registry access, configuration) are wrapped in a
//! single [`Error`] enum so the coordination services can propagate failures
//! with `?` across module boundaries.
//!
//! # Architecture
//!
//! - [`JobShardErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobshard::error::{Error, JobShardErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!("skipping cycle: {}", err);
//!     } else {
//!         tracing::error!("fatal: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::registry::RegistryError;

/// Common trait for all jobshard error types
pub trait JobShardErrorTrait: std::error::Error {
    /// Check if this error is transient (the current cycle can be skipped and retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Registry access errors (connection loss, session expiry, missing nodes)
    Registry,
    /// Configuration and validation errors
    Config,
    /// Leader election and sharding coordination errors
    Coordination,
    /// Serialization and parsing errors
    Serialization,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Config => "config",
            Self::Coordination => "coordination",
            Self::Serialization => "serialization",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the jobshard crate
#[derive(Error, Debug)]
pub enum Error {
    /// Registry access errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invalid configuration value
    #[error("Config error in '{field}': {reason}")]
    Config { field: String, reason: String },

    /// No configuration stored for the job
    #[error("Job '{job_name}' is not registered")]
    JobNotRegistered { job_name: String },

    /// Stored configuration belongs to a different job type
    #[error("Job '{job_name}' conflicts with registry: stored type is '{stored}', local type is '{local}'")]
    JobConflict {
        job_name: String,
        stored: String,
        local: String,
    },

    /// Waited too long for another instance to finish resharding
    #[error("Timed out after {waited_ms}ms waiting for sharding of job '{job_name}'")]
    ShardingTimeout { job_name: String, waited_ms: u64 },

    /// No leader could be elected within the wait timeout
    #[error("Timed out after {waited_ms}ms waiting for a leader of job '{job_name}'")]
    LeaderElectionTimeout { job_name: String, waited_ms: u64 },

    /// Sharding item outside `[0, sharding_total_count)`
    #[error("Sharding item {item} is out of range for total count {total}")]
    InvalidShardingItem { item: u32, total: u32 },

    /// Unknown sharding strategy name
    #[error("Unknown sharding strategy '{0}'")]
    UnknownStrategy(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl JobShardErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_recoverable(),
            Self::ShardingTimeout { .. } | Self::LeaderElectionTimeout { .. } => true,
            Self::Io(_) => true,
            Self::Config { .. }
            | Self::JobNotRegistered { .. }
            | Self::JobConflict { .. }
            | Self::InvalidShardingItem { .. }
            | Self::UnknownStrategy(_)
            | Self::Json(_)
            | Self::Toml(_)
            | Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Registry(_) => ErrorCategory::Registry,
            Self::Config { .. }
            | Self::JobNotRegistered { .. }
            | Self::JobConflict { .. }
            | Self::UnknownStrategy(_) => ErrorCategory::Config,
            Self::ShardingTimeout { .. }
            | Self::LeaderElectionTimeout { .. }
            | Self::InvalidShardingItem { .. } => ErrorCategory::Coordination,
            Self::Json(_) | Self::Toml(_) => ErrorCategory::Serialization,
            Self::Io(_) | Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a job-not-registered error
    pub fn job_not_registered(job_name: impl Into<String>) -> Self {
        Self::JobNotRegistered {
            job_name: job_name.into(),
        }
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
