use crate::aggregator::AggregatedToolSet;
use muster_core::{MusterResult, ToolDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

/// On-disk record of the tools each provider offered during the last run.
///
/// Layout: `{ "<provider>": [ { "name", "description", "parameters" } ] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolCache {
    providers: BTreeMap<String, Vec<CachedTool>>,
}

impl ToolCache {
    /// Groups `set` by owning provider.
    pub fn from_set(set: &AggregatedToolSet) -> Self {
        let mut providers: BTreeMap<String, Vec<CachedTool>> = BTreeMap::new();
        for tool in set.iter() {
            providers
                .entry(tool.provider.clone())
                .or_default()
                .push(CachedTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.schema.clone(),
                });
        }
        Self { providers }
    }

    /// Rebuilds the tool set the cache was written from.
    pub fn to_set(&self) -> AggregatedToolSet {
        AggregatedToolSet::from_tools(self.providers.iter().flat_map(|(provider, tools)| {
            tools.iter().map(move |t| {
                ToolDescriptor::new(&t.name, provider, &t.description)
                    .with_schema(t.parameters.clone())
            })
        }))
    }

    /// Providers present in the cache, sorted.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Tools across every provider.
    pub fn tool_count(&self) -> usize {
        self.providers.values().map(Vec::len).sum()
    }

    /// Writes the cache as pretty JSON, creating parent directories.
    pub async fn write(&self, path: &Path) -> MusterResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::info!(path = %path.display(), tools = self.tool_count(), "Tool cache written");
        Ok(())
    }

    /// Reads a cache written by [`write`](Self::write).
    pub async fn load(path: &Path) -> MusterResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}
