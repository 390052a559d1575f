//! Cluster members and the discovery events that admit and remove them.
//!
//! A [`Node`] is built exactly once, by the topology registry, when its
//! [`NodeSpec`] is admitted. It is never mutated afterwards; departure removes it
//! from later snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{ClusterError, ClusterResult};
use crate::constants::RECOGNIZED_ATTRIBUTE_KEYS;
use crate::types::{JoinOrder, NodeId};

/// Whether a node holds data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Owns partitions and executes operations against them.
    Server,
    /// Never owns data. Talks to servers, optionally through a near cache.
    Client,
}

impl NodeRole {
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, NodeRole::Server)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Server => write!(f, "server"),
            NodeRole::Client => write!(f, "client"),
        }
    }
}

/// String attributes attached to a node at admission.
///
/// Keys are restricted to [`RECOGNIZED_ATTRIBUTE_KEYS`]. Stored sorted so that
/// iteration order is identical on every member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct NodeAttributes(BTreeMap<String, String>);

impl NodeAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute, rejecting keys outside the recognized set.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> ClusterResult<Self> {
        check_key(key)?;
        self.0.insert(key.to_string(), value.into());
        Ok(self)
    }

    /// Build from key/value pairs, rejecting the first unrecognized key.
    pub fn from_pairs<I, K, V>(pairs: I) -> ClusterResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            let k = k.into();
            check_key(&k)?;
            map.insert(k, v.into());
        }
        Ok(Self(map))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl TryFrom<BTreeMap<String, String>> for NodeAttributes {
    type Error = ClusterError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::from_pairs(map)
    }
}

impl From<NodeAttributes> for BTreeMap<String, String> {
    fn from(attrs: NodeAttributes) -> Self {
        attrs.0
    }
}

fn check_key(key: &str) -> ClusterResult<()> {
    if RECOGNIZED_ATTRIBUTE_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(ClusterError::UnknownAttribute {
            key: key.to_string(),
        })
    }
}

/// What discovery knows about a node before admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub role: NodeRole,
    pub attributes: NodeAttributes,
}

impl NodeSpec {
    pub fn server(id: NodeId) -> Self {
        Self {
            id,
            role: NodeRole::Server,
            attributes: NodeAttributes::new(),
        }
    }

    pub fn client(id: NodeId) -> Self {
        Self {
            id,
            role: NodeRole::Client,
            attributes: NodeAttributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: NodeAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// An admitted cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    id: NodeId,
    order: JoinOrder,
    role: NodeRole,
    attributes: NodeAttributes,
}

impl Node {
    /// Only the topology registry hands out join orders.
    pub(crate) fn admit(spec: NodeSpec, order: JoinOrder) -> Self {
        Self {
            id: spec.id,
            order,
            role: spec.role,
            attributes: spec.attributes,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn order(&self) -> JoinOrder {
        self.order
    }

    #[inline]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.role.is_server()
    }

    pub fn attributes(&self) -> &NodeAttributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }
}

/// Membership change reported by the discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DiscoveryEvent {
    Join(NodeSpec),
    Leave { id: NodeId },
}

impl DiscoveryEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            DiscoveryEvent::Join(spec) => spec.id,
            DiscoveryEvent::Leave { id } => *id,
        }
    }
}
