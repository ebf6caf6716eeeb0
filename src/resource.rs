//! Resource identity and the dependency tree of protected resources.
//!
//! A protected resource is identified by a [`Resource`] (id, type, name).
//! Dependencies between resources (an instance and its attached volumes)
//! form a [`ResourceTree`] rooted at the top-level protected resource.
//! The tree is stored as an index-based arena, so traversal never recurses
//! and node handles are plain copyable indices.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or inspecting a resource tree.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A resource id may appear at most once per tree.
    #[error("resource id already present in tree: {0}")]
    DuplicateId(String),

    /// A node handle did not come from this tree.
    #[error("unknown node handle: {0:?}")]
    UnknownNode(NodeId),
}

/// The closed set of resource types the engine can protect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// A compute instance.
    #[serde(rename = "OS::Nova::Server")]
    Server,
    /// A block-storage volume.
    #[serde(rename = "OS::Cinder::Volume")]
    Volume,
    /// A stored disk image.
    #[serde(rename = "OS::Glance::Image")]
    Image,
    /// A virtual network.
    #[serde(rename = "OS::Neutron::Network")]
    Network,
}

impl ResourceType {
    /// Wire name of this resource type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Server => "OS::Nova::Server",
            ResourceType::Volume => "OS::Cinder::Volume",
            ResourceType::Image => "OS::Glance::Image",
            ResourceType::Network => "OS::Neutron::Network",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed identifier for one protected resource. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Service-side identifier of the resource.
    pub id: String,
    /// Which service owns the resource.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Human-readable name.
    pub name: String,
}

impl Resource {
    /// Create a resource identifier.
    pub fn new(
        id: impl Into<String>,
        resource_type: ResourceType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type,
            name: name.into(),
        }
    }
}

/// Handle to a node inside a [`ResourceTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct NodeSlot {
    resource: Resource,
    children: Vec<NodeId>,
}

/// Tree of a primary resource and its dependents, stored as an arena.
///
/// Invariant: every resource id appears at most once per tree, enforced
/// at insertion time.
#[derive(Debug, Clone)]
pub struct ResourceTree {
    nodes: Vec<NodeSlot>,
    seen_ids: HashSet<String>,
}

impl ResourceTree {
    /// Create a tree with `root` as the top-level protected resource.
    pub fn new(root: Resource) -> Self {
        let mut seen_ids = HashSet::new();
        seen_ids.insert(root.id.clone());
        Self {
            nodes: vec![NodeSlot {
                resource: root,
                children: Vec::new(),
            }],
            seen_ids,
        }
    }

    /// Handle of the root node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Attach `resource` as the last child of `parent`.
    pub fn add_child(&mut self, parent: NodeId, resource: Resource) -> Result<NodeId, ResourceError> {
        if parent.0 >= self.nodes.len() {
            return Err(ResourceError::UnknownNode(parent));
        }
        if !self.seen_ids.insert(resource.id.clone()) {
            return Err(ResourceError::DuplicateId(resource.id));
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeSlot {
            resource,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    /// The resource stored at `node`.
    pub fn resource(&self, node: NodeId) -> &Resource {
        &self.nodes[node.0].resource
    }

    /// Child handles of `node`, in insertion order.
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].children
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree is empty. Always false: a tree has at least a root.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True if `resource_id` is present anywhere in the tree.
    pub fn contains(&self, resource_id: &str) -> bool {
        self.seen_ids.contains(resource_id)
    }

    /// Nodes in post-order: every child precedes its parent.
    ///
    /// Protection processes resources in this order so that a parent's
    /// metadata can fold in identifiers its children produced.
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root(), 0usize)];
        while let Some((node, next_child)) = stack.pop() {
            let children = &self.nodes[node.0].children;
            if next_child < children.len() {
                stack.push((node, next_child + 1));
                stack.push((children[next_child], 0));
            } else {
                out.push(node);
            }
        }
        out
    }

    /// Nodes in pre-order: every parent precedes its children.
    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            out.push(node);
            for &child in self.nodes[node.0].children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}
