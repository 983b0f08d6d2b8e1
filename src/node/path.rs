//! Registry path layout for a job
//!
//! Every key the engine reads or writes is built here. The layout is the
//! compatibility contract with other deployments sharing the registry:
//!
//! ```text
//! /<job>/config
//! /<job>/servers/<ip>
//! /<job>/instances/<instance-id>
//! /<job>/leader/election/latch/<sequence>
//! /<job>/sharding/necessary
//! /<job>/sharding/processing
//! /<job>/sharding/<item>/{instance,running,misfire,disabled,failover}
//! /<job>/failover/<job>/<item>
//! ```

pub const CONFIG_NODE: &str = "config";
pub const SERVERS_NODE: &str = "servers";
pub const INSTANCES_NODE: &str = "instances";
pub const LEADER_NODE: &str = "leader";
pub const LEADER_LATCH_NODE: &str = "leader/election/latch";
pub const SHARDING_NODE: &str = "sharding";
pub const NECESSARY_NODE: &str = "sharding/necessary";
pub const PROCESSING_NODE: &str = "sharding/processing";
pub const FAILOVER_NODE: &str = "failover";

/// Marker nodes kept below `sharding/<item>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemNode {
    /// Owning instance id
    Instance,
    /// Present while the item executes; value is the executing instance
    Running,
    /// A trigger fired while the item was running
    Misfire,
    /// Operator disabled the item
    Disabled,
    /// Claimed for failover; value is the claiming instance
    Failover,
}

impl ItemNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Running => "running",
            Self::Misfire => "misfire",
            Self::Disabled => "disabled",
            Self::Failover => "failover",
        }
    }
}

/// Builds registry keys for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodePath {
    job_name: String,
}

impl JobNodePath {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// `/<job>`
    pub fn root(&self) -> String {
        format!("/{}", self.job_name)
    }

    /// Absolute key of a node given relative to the job root
    pub fn full_path(&self, node: &str) -> String {
        if node.is_empty() {
            self.root()
        } else {
            format!("/{}/{}", self.job_name, node)
        }
    }

    // ------------------------------------------------------------------------
    // Nodes relative to the job root
    // ------------------------------------------------------------------------

    pub fn server_node(&self, server_ip: &str) -> String {
        format!("{}/{}", SERVERS_NODE, server_ip)
    }

    pub fn instance_node(&self, instance_id: &str) -> String {
        format!("{}/{}", INSTANCES_NODE, instance_id)
    }

    /// `sharding/<item>`
    pub fn item_root_node(&self, item: u32) -> String {
        format!("{}/{}", SHARDING_NODE, item)
    }

    /// `sharding/<item>/<marker>`
    pub fn item_node(&self, item: u32, node: ItemNode) -> String {
        format!("{}/{}/{}", SHARDING_NODE, item, node.as_str())
    }

    /// `failover/<job>`: queue of crashed items
    pub fn failover_queue_node(&self) -> String {
        format!("{}/{}", FAILOVER_NODE, self.job_name)
    }

    pub fn failover_record_node(&self, item: u32) -> String {
        format!("{}/{}", self.failover_queue_node(), item)
    }

    // ------------------------------------------------------------------------
    // Absolute keys
    // ------------------------------------------------------------------------

    pub fn config_node_path(&self) -> String {
        self.full_path(CONFIG_NODE)
    }

    pub fn servers_node_path(&self) -> String {
        self.full_path(SERVERS_NODE)
    }

    pub fn server_node_path(&self, server_ip: &str) -> String {
        self.full_path(&self.server_node(server_ip))
    }

    pub fn instances_node_path(&self) -> String {
        self.full_path(INSTANCES_NODE)
    }

    pub fn instance_node_path(&self, instance_id: &str) -> String {
        self.full_path(&self.instance_node(instance_id))
    }

    pub fn leader_latch_path(&self) -> String {
        self.full_path(LEADER_LATCH_NODE)
    }

    pub fn sharding_node_path(&self) -> String {
        self.full_path(SHARDING_NODE)
    }

    pub fn item_root_path(&self, item: u32) -> String {
        self.full_path(&self.item_root_node(item))
    }

    pub fn item_node_path(&self, item: u32, node: ItemNode) -> String {
        self.full_path(&self.item_node(item, node))
    }

    pub fn necessary_node_path(&self) -> String {
        self.full_path(NECESSARY_NODE)
    }

    pub fn processing_node_path(&self) -> String {
        self.full_path(PROCESSING_NODE)
    }

    pub fn failover_queue_path(&self) -> String {
        self.full_path(&self.failover_queue_node())
    }

    pub fn failover_record_path(&self, item: u32) -> String {
        self.full_path(&self.failover_record_node(item))
    }

    // ------------------------------------------------------------------------
    // Classification of event paths
    // ------------------------------------------------------------------------

    pub fn is_config_path(&self, path: &str) -> bool {
        path == self.config_node_path()
    }

    /// Instance id if `path` is a direct child of `instances`
    pub fn instance_id_from_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        direct_child(path, &self.instances_node_path())
    }

    /// Server ip if `path` is a direct child of `servers`
    pub fn server_ip_from_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        direct_child(path, &self.servers_node_path())
    }

    /// Latch sequence name if `path` is a leader latch node
    pub fn latch_from_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        direct_child(path, &self.leader_latch_path())
    }

    /// Sharding item and marker if `path` is `sharding/<item>/<marker>`
    pub fn item_node_from_path(&self, path: &str) -> Option<(u32, ItemNode)> {
        let rest = path.strip_prefix(&format!("{}/", self.sharding_node_path()))?;
        let (item, marker) = rest.split_once('/')?;
        let item = item.parse().ok()?;
        [
            ItemNode::Instance,
            ItemNode::Running,
            ItemNode::Misfire,
            ItemNode::Disabled,
            ItemNode::Failover,
        ]
        .into_iter()
        .find(|n| n.as_str() == marker)
        .map(|n| (item, n))
    }
}

fn direct_child<'a>(path: &'a str, parent: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}
