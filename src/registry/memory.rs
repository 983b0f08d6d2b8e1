//! In-process registry with session semantics
//!
//! [`MemoryRegistry`] plays the role of the coordination server: it holds the
//! node tree and broadcasts change events. Each [`MemoryRegistryClient`] is a
//! session; ephemeral nodes belong to the session that created them and are
//! removed (with `Removed` events) when the session is closed or expires.
//!
//! The registry can be switched unavailable to simulate a partition between
//! the clients and the coordination service.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::{
    is_under, DataWatch, EventKind, RegistryCenter, RegistryError, RegistryEvent, RegistryResult,
};

/// Default capacity of the change-event channel
const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ============================================================================
// Node Tree
// ============================================================================

#[derive(Debug, Clone)]
struct Node {
    data: String,
    version: u64,
    owner: Option<u64>,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    live_sessions: HashSet<u64>,
    next_session: u64,
    unavailable: bool,
    writes: u64,
}

impl Tree {
    fn check(&self, session: u64) -> RegistryResult<()> {
        if self.unavailable {
            return Err(RegistryError::Unavailable);
        }
        if !self.live_sessions.contains(&session) {
            return Err(RegistryError::SessionExpired);
        }
        Ok(())
    }

    fn children(&self, key: &str) -> Vec<String> {
        let prefix = if key == "/" {
            "/".to_string()
        } else {
            format!("{key}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let rest = &path[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    /// Create missing ancestors of `key` as empty persistent nodes
    fn ensure_parents(&mut self, key: &str, events: &mut Vec<RegistryEvent>) {
        let mut end = 0;
        while let Some(pos) = key[end + 1..].find('/') {
            end += pos + 1;
            let parent = &key[..end];
            if !self.nodes.contains_key(parent) {
                self.nodes.insert(
                    parent.to_string(),
                    Node {
                        data: String::new(),
                        version: 0,
                        owner: None,
                    },
                );
                events.push(RegistryEvent::new(
                    EventKind::Added,
                    parent,
                    Some(String::new()),
                ));
            }
        }
    }

    fn create(
        &mut self,
        key: &str,
        value: &str,
        owner: Option<u64>,
        events: &mut Vec<RegistryEvent>,
    ) {
        self.ensure_parents(key, events);
        self.nodes.insert(
            key.to_string(),
            Node {
                data: value.to_string(),
                version: 0,
                owner,
            },
        );
        self.writes += 1;
        events.push(RegistryEvent::new(
            EventKind::Added,
            key,
            Some(value.to_string()),
        ));
    }

    fn overwrite(&mut self, key: &str, value: &str, events: &mut Vec<RegistryEvent>) -> bool {
        match self.nodes.get_mut(key) {
            Some(node) => {
                node.data = value.to_string();
                node.version += 1;
                self.writes += 1;
                events.push(RegistryEvent::new(
                    EventKind::Updated,
                    key,
                    Some(value.to_string()),
                ));
                true
            }
            None => false,
        }
    }

    fn remove_recursive(&mut self, key: &str, events: &mut Vec<RegistryEvent>) {
        let doomed: Vec<String> = self
            .nodes
            .range(key.to_string()..)
            .take_while(|(path, _)| path.starts_with(key))
            .filter(|(path, _)| is_under(path, key))
            .map(|(path, _)| path.clone())
            .collect();

        for path in doomed.into_iter().rev() {
            if let Some(node) = self.nodes.remove(&path) {
                self.writes += 1;
                events.push(RegistryEvent::new(EventKind::Removed, path, Some(node.data)));
            }
        }
    }

    fn next_sequence(&mut self, parent: &str) -> u64 {
        let counter = self.sequences.entry(parent.to_string()).or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }
}

fn validate_path(key: &str) -> RegistryResult<()> {
    let valid = key.starts_with('/')
        && (key == "/" || !key.ends_with('/'))
        && !key.contains("//");
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidPath(key.to_string()))
    }
}

// ============================================================================
// Memory Registry
// ============================================================================

struct Shared {
    tree: RwLock<Tree>,
    events: broadcast::Sender<RegistryEvent>,
}

/// In-memory coordination registry shared by all of its client sessions
#[derive(Clone)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty registry with a custom change-event buffer
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(Tree::default()),
                events,
            }),
        }
    }

    /// Open a new client session
    pub async fn connect(&self) -> MemoryRegistryClient {
        let mut tree = self.shared.tree.write().await;
        tree.next_session += 1;
        let session = tree.next_session;
        tree.live_sessions.insert(session);
        tracing::debug!(session, "Registry session opened");

        MemoryRegistryClient {
            registry: self.clone(),
            session,
        }
    }

    /// Simulate losing (or regaining) connectivity to the registry
    pub async fn set_available(&self, available: bool) {
        self.shared.tree.write().await.unavailable = !available;
    }

    /// Version of a node: 0 on creation, incremented by every overwrite
    pub async fn version(&self, key: &str) -> Option<u64> {
        self.shared.tree.read().await.nodes.get(key).map(|n| n.version)
    }

    /// Total number of node writes (creates, overwrites, deletes) so far
    pub async fn write_count(&self) -> u64 {
        self.shared.tree.read().await.writes
    }

    /// Snapshot of every node below `prefix` as `(path, value)` pairs
    pub async fn dump(&self, prefix: &str) -> Vec<(String, String)> {
        self.shared
            .tree
            .read()
            .await
            .nodes
            .iter()
            .filter(|(path, _)| is_under(path, prefix))
            .map(|(path, node)| (path.clone(), node.data.clone()))
            .collect()
    }

    /// Expire a session, dropping its ephemeral nodes
    async fn expire(&self, session: u64) {
        let mut events = Vec::new();
        let mut tree = self.shared.tree.write().await;
        if !tree.live_sessions.remove(&session) {
            return;
        }
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            tree.remove_recursive(&path, &mut events);
        }
        tracing::debug!(session, removed = events.len(), "Registry session closed");
        self.publish(events);
        drop(tree);
    }

    fn publish(&self, events: Vec<RegistryEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.shared.events.send(event);
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Client Session
// ============================================================================

/// A session against a [`MemoryRegistry`]
pub struct MemoryRegistryClient {
    registry: MemoryRegistry,
    session: u64,
}

impl MemoryRegistryClient {
    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// The registry this session is connected to
    pub fn registry(&self) -> &MemoryRegistry {
        &self.registry
    }

    /// Close the session; ephemeral nodes are removed as on a crash
    pub async fn close(&self) {
        self.registry.expire(self.session).await;
    }

    async fn write<T>(
        &self,
        key: &str,
        op: impl FnOnce(&mut Tree, &mut Vec<RegistryEvent>) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        validate_path(key)?;
        let mut events = Vec::new();
        let mut tree = self.registry.shared.tree.write().await;
        tree.check(self.session)?;
        let result = op(&mut *tree, &mut events);
        // Publish under the write guard so event order matches tree order
        self.registry.publish(events);
        drop(tree);
        result
    }

    async fn read<T>(&self, key: &str, op: impl FnOnce(&Tree) -> T) -> RegistryResult<T> {
        validate_path(key)?;
        let tree = self.registry.shared.tree.read().await;
        tree.check(self.session)?;
        Ok(op(&*tree))
    }
}

#[async_trait]
impl RegistryCenter for MemoryRegistryClient {
    async fn get(&self, key: &str) -> RegistryResult<Option<String>> {
        self.get_directly(key).await
    }

    async fn get_directly(&self, key: &str) -> RegistryResult<Option<String>> {
        self.read(key, |tree| tree.nodes.get(key).map(|n| n.data.clone()))
            .await
    }

    async fn is_existed(&self, key: &str) -> RegistryResult<bool> {
        self.read(key, |tree| tree.nodes.contains_key(key)).await
    }

    async fn get_children_keys(&self, key: &str) -> RegistryResult<Vec<String>> {
        self.read(key, |tree| tree.children(key)).await
    }

    async fn get_num_children(&self, key: &str) -> RegistryResult<usize> {
        self.read(key, |tree| tree.children(key).len()).await
    }

    async fn persist(&self, key: &str, value: &str) -> RegistryResult<()> {
        self.write(key, |tree, events| {
            if !tree.overwrite(key, value, events) {
                tree.create(key, value, None, events);
            }
            Ok(())
        })
        .await
    }

    async fn update(&self, key: &str, value: &str) -> RegistryResult<()> {
        self.write(key, |tree, events| {
            if tree.overwrite(key, value, events) {
                Ok(())
            } else {
                Err(RegistryError::NoNode(key.to_string()))
            }
        })
        .await
    }

    async fn persist_ephemeral(&self, key: &str, value: &str) -> RegistryResult<()> {
        let session = self.session;
        self.write(key, |tree, events| {
            if tree.nodes.contains_key(key) {
                tree.remove_recursive(key, events);
            }
            tree.create(key, value, Some(session), events);
            Ok(())
        })
        .await
    }

    async fn persist_sequential(&self, key: &str, value: &str) -> RegistryResult<String> {
        self.write(key, |tree, events| {
            let seq = tree.next_sequence(key);
            let path = format!("{}/{:010}", key, seq);
            tree.create(&path, value, None, events);
            Ok(path)
        })
        .await
    }

    async fn persist_ephemeral_sequential(
        &self,
        key: &str,
        value: &str,
    ) -> RegistryResult<String> {
        let session = self.session;
        self.write(key, |tree, events| {
            let seq = tree.next_sequence(key);
            let path = format!("{}/{:010}", key, seq);
            tree.create(&path, value, Some(session), events);
            Ok(path)
        })
        .await
    }

    async fn remove(&self, key: &str) -> RegistryResult<()> {
        self.write(key, |tree, events| {
            tree.remove_recursive(key, events);
            Ok(())
        })
        .await
    }

    fn watch(&self, key: &str) -> DataWatch {
        DataWatch::new(key, self.registry.shared.events.subscribe())
    }
}

// ============================================================================
// Tests
// ============================================================================
