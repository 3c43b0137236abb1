use muster_core::ToolDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Priority of a provider when two offer the same tool name.
///
/// Orders by tier, then declaration index. The smaller rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderRank {
    /// Initialization tier.
    pub tier: u32,
    /// Declaration index.
    pub order: usize,
}

impl ProviderRank {
    /// Rank for `tier` and declaration index `order`.
    pub fn new(tier: u32, order: usize) -> Self {
        Self { tier, order }
    }
}

/// A tool name offered by more than one provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Collision {
    /// The contested name.
    pub tool: String,
    /// Provider whose descriptor is kept.
    pub kept: String,
    /// Provider whose descriptor was dropped.
    pub dropped: String,
}

#[derive(Debug, Clone)]
struct Entry {
    rank: ProviderRank,
    tool: ToolDescriptor,
    /// Every other provider that offered this name.
    shadowed: Vec<String>,
}

/// Immutable view of the merged namespace at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedToolSet {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl AggregatedToolSet {
    /// Builds a set from descriptors that are already conflict-free.
    /// Later duplicates replace earlier ones.
    pub fn from_tools(tools: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Descriptor for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Whether a tool called `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the set holds no tool.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names in lexical order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Descriptors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    /// Tool names grouped by owning provider. Both levels are sorted.
    pub fn by_provider(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for tool in self.tools.values() {
            grouped
                .entry(tool.provider.as_str())
                .or_default()
                .push(tool.name.as_str());
        }
        grouped
    }

    /// JSON array of every descriptor, for hand-off to the agent runtime.
    pub fn to_manifest(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.tools
                .values()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "provider": t.provider,
                        "description": t.description,
                        "inputSchema": t.schema,
                    })
                })
                .collect(),
        )
    }
}

/// Merges capability descriptors from every Ready provider into one
/// namespace.
///
/// Registration order does not matter: for every name the entry held is the
/// one from the smallest [`ProviderRank`] seen so far, and
/// [`collisions`](Self::collisions) pairs each shadowed provider with that
/// final winner.
#[derive(Debug, Default)]
pub struct ToolAggregator {
    entries: parking_lot::RwLock<BTreeMap<String, Entry>>,
}

impl ToolAggregator {
    /// An empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tools` owned by `provider`.
    pub fn register(&self, provider: &str, rank: ProviderRank, tools: &[ToolDescriptor]) {
        let mut entries = self.entries.write();

        for tool in tools {
            let mut tool = tool.clone();
            tool.provider = provider.to_string();

            match entries.get_mut(&tool.name) {
                None => {
                    entries.insert(
                        tool.name.clone(),
                        Entry {
                            rank,
                            tool,
                            shadowed: Vec::new(),
                        },
                    );
                }
                Some(existing) if existing.tool.provider == provider => {
                    // Same provider listing a name twice: keep the first.
                }
                Some(existing) if rank < existing.rank => {
                    tracing::warn!(
                        tool = %tool.name,
                        kept = %provider,
                        dropped = %existing.tool.provider,
                        "Tool name collision"
                    );
                    let previous = std::mem::replace(&mut existing.tool, tool);
                    existing.rank = rank;
                    existing.shadowed.push(previous.provider);
                }
                Some(existing) => {
                    tracing::warn!(
                        tool = %tool.name,
                        kept = %existing.tool.provider,
                        dropped = %provider,
                        "Tool name collision"
                    );
                    existing.shadowed.push(provider.to_string());
                }
            }
        }
    }

    /// Every shadowed descriptor, paired with the provider that finally owns
    /// the name. Sorted and independent of registration order.
    pub fn collisions(&self) -> Vec<Collision> {
        let entries = self.entries.read();
        let mut collisions: Vec<Collision> = entries
            .iter()
            .flat_map(|(name, e)| {
                e.shadowed.iter().map(move |dropped| Collision {
                    tool: name.clone(),
                    kept: e.tool.provider.clone(),
                    dropped: dropped.clone(),
                })
            })
            .collect();
        collisions.sort();
        collisions.dedup();
        collisions
    }

    /// The merged namespace as it stands now.
    pub fn snapshot(&self) -> AggregatedToolSet {
        AggregatedToolSet {
            tools: self
                .entries
                .read()
                .iter()
                .map(|(name, e)| (name.clone(), e.tool.clone()))
                .collect(),
        }
    }

    /// Forget every registration, collisions included.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of distinct tool names.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no tool is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
