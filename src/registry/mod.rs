//! Coordination registry abstraction
//!
//! The coordination engine only talks to the registry through the
//! [`RegistryCenter`] trait: a hierarchical key/value store with persistent,
//! ephemeral and sequential nodes, children listing and change events.
//! Writes are linearizable per key; nothing spans multiple keys.
//!
//! Connection management, retries and caching belong to the client behind the
//! trait. [`memory::MemoryRegistry`] is an in-process implementation with
//! sessions, used by the tests and the `simulate` command.
//!
//! # Node semantics
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | `persist` | create (with missing parents) or overwrite |
//! | `update` | overwrite an existing node, `NoNode` otherwise |
//! | `persist_ephemeral` | replace any existing node with one owned by the session |
//! | `persist_*_sequential` | create `{key}/{seq:010}` and return its path |
//! | `remove` | delete the node and all of its children, no-op if absent |

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::{ErrorCategory, JobShardErrorTrait};

pub use memory::{MemoryRegistry, MemoryRegistryClient};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by a registry client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry cannot be reached
    #[error("Registry unavailable")]
    Unavailable,

    /// The client session has expired or was closed
    #[error("Registry session expired")]
    SessionExpired,

    /// The node does not exist
    #[error("No node at '{0}'")]
    NoNode(String),

    /// The key is not an absolute registry path
    #[error("Invalid registry path '{0}'")]
    InvalidPath(String),
}

impl JobShardErrorTrait for RegistryError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::SessionExpired)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Registry
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// Change Events
// ============================================================================

/// Kind of change observed on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Added,
    Updated,
    Removed,
}

/// A single node change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub kind: EventKind,
    pub path: String,
    /// New value for added/updated nodes, last value for removed nodes
    pub data: Option<String>,
}

impl RegistryEvent {
    pub fn new(kind: EventKind, path: impl Into<String>, data: Option<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            data,
        }
    }

    /// Value of the node, empty string when absent
    pub fn data_or_empty(&self) -> &str {
        self.data.as_deref().unwrap_or("")
    }
}

/// Item delivered by a [`DataWatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchItem {
    /// A change under the watched key
    Event(RegistryEvent),
    /// The subscriber fell behind and this many events were dropped
    Lagged(u64),
}

/// Subscription to changes at or below a key
pub struct DataWatch {
    prefix: String,
    rx: broadcast::Receiver<RegistryEvent>,
}

impl DataWatch {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<RegistryEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Watched key
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next change under the watched key.
    ///
    /// Returns `None` once the registry side of the channel is gone.
    pub async fn recv(&mut self) -> Option<WatchItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if is_under(&event.path, &self.prefix) {
                        return Some(WatchItem::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return Some(WatchItem::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Check whether `path` equals `prefix` or lives below it
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

// ============================================================================
// Registry Center
// ============================================================================

/// Client view of the coordination registry
#[async_trait]
pub trait RegistryCenter: Send + Sync {
    /// Read a node, possibly from a client-side cache
    async fn get(&self, key: &str) -> RegistryResult<Option<String>>;

    /// Read a node from the registry itself, bypassing any cache
    async fn get_directly(&self, key: &str) -> RegistryResult<Option<String>>;

    async fn is_existed(&self, key: &str) -> RegistryResult<bool>;

    /// Names (not full paths) of the direct children, sorted ascending
    async fn get_children_keys(&self, key: &str) -> RegistryResult<Vec<String>>;

    async fn get_num_children(&self, key: &str) -> RegistryResult<usize>;

    async fn persist(&self, key: &str, value: &str) -> RegistryResult<()>;

    async fn update(&self, key: &str, value: &str) -> RegistryResult<()>;

    async fn persist_ephemeral(&self, key: &str, value: &str) -> RegistryResult<()>;

    async fn persist_sequential(&self, key: &str, value: &str) -> RegistryResult<String>;

    async fn persist_ephemeral_sequential(&self, key: &str, value: &str)
        -> RegistryResult<String>;

    async fn remove(&self, key: &str) -> RegistryResult<()>;

    /// Subscribe to changes at or below `key`
    fn watch(&self, key: &str) -> DataWatch;
}
