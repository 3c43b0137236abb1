use crate::backoff::RetryPolicy;
use crate::scheduler::AbortOn;
use crate::spec::{ProviderRegistry, TierInference};
use muster_core::{MusterError, MusterResult};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Provider entries in declaration order, each still unparsed.
///
/// Entries are kept raw so one malformed provider cannot fail the whole file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEntries(pub Vec<(String, serde_json::Value)>);

impl<'de> Deserialize<'de> for ServerEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ServerEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of provider name to provider entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, raw)) = map.next_entry::<String, serde_json::Value>()? {
                    entries.push((name, raw));
                }
                Ok(ServerEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_safe_servers() -> Vec<String> {
    vec!["filesystem".to_string(), "server-memory".to_string()]
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrchestratorSettings {
    /// Attempts per provider, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bound on each launch, handshake and manifest query.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Bound on closing one provider.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: RetryPolicy,
    /// Providers considered reliable enough for safe mode.
    #[serde(default = "default_safe_servers")]
    pub safe_servers: Vec<String>,
    /// Providers at or below this tier are also safe.
    #[serde(default)]
    pub safe_max_tier: Option<u32>,
    /// How tiers are derived when entries omit one.
    #[serde(default)]
    pub tier_inference: TierInference,
    /// Which failures abort a fail-fast run.
    #[serde(default)]
    pub abort_on: AbortOn,
    /// Substitute the built-in tool set when nothing comes up.
    #[serde(default = "default_true")]
    pub auto_fallback: bool,
    /// Overrides the default agent instructions.
    #[serde(default)]
    pub base_instructions: Option<String>,
    /// Where to write the discovered tool listing after a run.
    #[serde(default)]
    pub tool_cache: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            backoff: RetryPolicy::default(),
            safe_servers: default_safe_servers(),
            safe_max_tier: None,
            tier_inference: TierInference::default(),
            abort_on: AbortOn::default(),
            auto_fallback: true,
            base_instructions: None,
            tool_cache: None,
        }
    }
}

impl OrchestratorSettings {
    /// `attempt_timeout_secs` as a duration.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// `shutdown_timeout_secs` as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// `[agent]` section: the downstream runtime handed the capability set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AgentSettings {
    /// Program to run after initialization. The rendered instructions are printed when unset.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for `command`.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Full configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MusterConfig {
    /// Provider entries, in declaration order.
    #[serde(default, rename = "mcpServers", alias = "mcp_servers")]
    pub mcp_servers: ServerEntries,
    /// `[orchestrator]` section.
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// `[agent]` section.
    #[serde(default)]
    pub agent: AgentSettings,
}

impl MusterConfig {
    /// Parses a `muster.toml` document.
    pub fn from_toml_str(content: &str) -> MusterResult<Self> {
        toml::from_str(content).map_err(|e| MusterError::Config(format!("invalid TOML: {e}")))
    }

    /// Parses an `mcp_config.json` document.
    pub fn from_json_str(content: &str) -> MusterResult<Self> {
        serde_json::from_str(content).map_err(|e| MusterError::Config(format!("invalid JSON: {e}")))
    }

    /// Read `path`, choosing JSON for a `.json` extension and TOML otherwise.
    pub async fn load(path: &Path) -> MusterResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MusterError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Materialize provider specs from `mcpServers`.
    pub fn registry(&self) -> MusterResult<ProviderRegistry> {
        ProviderRegistry::from_entries(&self.mcp_servers.0, self.orchestrator.tier_inference)
    }
}
