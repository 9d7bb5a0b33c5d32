//! Knowledge node types and identity.
//!
//! A node is a small text record with structured metadata. Nodes are owned
//! by the storage layer; the maintenance pipelines read them through
//! [`RegistryEntry`] projections and only rewrite them during ingestion and
//! merges.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable node identifier.
///
/// Generated ids are simple (hyphen-free) UUIDs so they double as file
/// names, but any non-empty string is accepted when reading existing graphs.
///
/// # Examples
///
/// ```
/// use kyrograph::NodeId;
///
/// let id = NodeId::generate();
/// assert!(!id.as_str().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new random node id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Who the user is
    Identity,
    /// Stated likes, dislikes and working habits
    Preference,
    /// An ongoing piece of work
    Project,
    /// A decision and its rationale
    Decision,
    /// A standalone fact
    Fact,
    /// Something that happened at a point in time
    Episode,
    /// A synthesized insight
    Reflection,
    /// Map of content: a curated table of contents
    Moc,
    /// Generated index
    Index,
    /// Current-state summary
    Now,
}

impl NodeType {
    /// Every node type, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Identity,
        Self::Preference,
        Self::Project,
        Self::Decision,
        Self::Fact,
        Self::Episode,
        Self::Reflection,
        Self::Moc,
        Self::Index,
        Self::Now,
    ];

    /// Structural nodes are generated views and never merge targets.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(self, Self::Moc | Self::Index | Self::Now)
    }

    /// Returns the wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Preference => "preference",
            Self::Project => "project",
            Self::Decision => "decision",
            Self::Fact => "fact",
            Self::Episode => "episode",
            Self::Reflection => "reflection",
            Self::Moc => "moc",
            Self::Index => "index",
            Self::Now => "now",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier used by context selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Always relevant
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

/// A knowledge graph node as stored on disk.
///
/// Invariant: an archived node carries `merged_into` and is excluded from
/// candidate generation and from being a merge keeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeNode {
    pub id: NodeId,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Dotted concept key; merge and upsert identity.
    pub canonical_key: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Outgoing references to other nodes.
    #[serde(default)]
    pub links: Vec<NodeId>,

    /// Canonical keys absorbed through merges.
    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub archived: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<NodeId>,

    #[serde(skip)]
    pub body: String,
}

impl KnowledgeNode {
    /// Creates a new live node with a generated id.
    ///
    /// # Examples
    ///
    /// ```
    /// use kyrograph::{KnowledgeNode, NodeType};
    ///
    /// let node = KnowledgeNode::new(NodeType::Preference, "preferences.editor", "uses helix");
    /// assert!(!node.archived);
    /// assert_eq!(node.created_at, node.updated_at);
    /// ```
    #[must_use]
    pub fn new(
        node_type: NodeType,
        canonical_key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::with_id(NodeId::generate(), node_type, canonical_key, description)
    }

    /// Creates a new live node with a specific id.
    #[must_use]
    pub fn with_id(
        id: NodeId,
        node_type: NodeType,
        canonical_key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_type,
            canonical_key: canonical_key.into(),
            description: description.into(),
            priority: Priority::default(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            links: Vec::new(),
            aliases: Vec::new(),
            archived: false,
            merged_into: None,
            body: String::new(),
        }
    }

    /// Returns true if `key` is this node's canonical key or one of its aliases.
    #[must_use]
    pub fn answers_to(&self, key: &str) -> bool {
        self.canonical_key == key || self.aliases.iter().any(|alias| alias == key)
    }

    /// Marks the node archived into `keeper`.
    pub fn archive_into(&mut self, keeper: &NodeId) {
        self.archived = true;
        self.merged_into = Some(keeper.clone());
        self.touch();
    }

    /// Sets `updated_at` to now, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Metadata-only projection of this node at `path`.
    #[must_use]
    pub fn to_entry(&self, path: impl Into<PathBuf>) -> RegistryEntry {
        RegistryEntry {
            id: self.id.clone(),
            node_type: self.node_type,
            canonical_key: self.canonical_key.clone(),
            description: self.description.clone(),
            priority: self.priority,
            created_at: self.created_at,
            updated_at: self.updated_at,
            tags: self.tags.clone(),
            links: self.links.clone(),
            aliases: self.aliases.clone(),
            archived: self.archived,
            merged_into: self.merged_into.clone(),
            path: path.into(),
        }
    }
}

/// Metadata-only projection of a [`KnowledgeNode`], used for bulk scans.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub id: NodeId,
    pub node_type: NodeType,
    pub canonical_key: String,
    pub description: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub links: Vec<NodeId>,
    pub aliases: Vec<String>,
    pub archived: bool,
    pub merged_into: Option<NodeId>,
    /// Location of the backing node file.
    pub path: PathBuf,
}

impl RegistryEntry {
    /// First dotted segment of the canonical key.
    #[must_use]
    pub fn key_head(&self) -> &str {
        self.canonical_key
            .split('.')
            .next()
            .unwrap_or(self.canonical_key.as_str())
    }

    /// Returns true if `key` is this entry's canonical key or one of its aliases.
    #[must_use]
    pub fn answers_to(&self, key: &str) -> bool {
        self.canonical_key == key || self.aliases.iter().any(|alias| alias == key)
    }

    /// Text used for similarity scoring.
    ///
    /// Falls back to the key's last segment when the description is empty.
    #[must_use]
    pub fn comparison_text(&self) -> String {
        if self.description.trim().is_empty() {
            self.canonical_key
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .replace(['_', '-'], " ")
        } else {
            self.description.clone()
        }
    }
}

/// A node as proposed by the external model during bootstrap, before it is
/// assigned an id and location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDraft {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub canonical_key: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Referenced canonical keys or node ids.
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
}
