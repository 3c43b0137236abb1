use muster_core::{MusterError, MusterResult};
use muster_mcp::LaunchDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Coarse classification of a server by its name.
///
/// Used for category-based tier inference and for the capability hints the
/// announcer adds to agent instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerCategory {
    /// Local file access.
    Filesystem,
    /// Knowledge graph and memory stores.
    Memory,
    /// Web search providers.
    Search,
    /// GitHub repositories and issues.
    Github,
    /// Browser automation.
    Browser,
    /// Mail.
    Email,
    /// Calendars and scheduling.
    Calendar,
    /// Lodging search.
    Airbnb,
    /// Speech synthesis.
    Elevenlabs,
    /// Anything unrecognized.
    Other,
}

impl ServerCategory {
    /// Initialization tier implied by the category. Lower starts earlier.
    pub fn tier(self) -> u32 {
        match self {
            ServerCategory::Filesystem => 1,
            ServerCategory::Memory => 2,
            ServerCategory::Search => 3,
            ServerCategory::Github => 4,
            ServerCategory::Browser => 5,
            ServerCategory::Email => 6,
            ServerCategory::Calendar => 7,
            ServerCategory::Airbnb => 8,
            ServerCategory::Elevenlabs => 9,
            ServerCategory::Other => 10,
        }
    }
}

impl std::fmt::Display for ServerCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServerCategory::Filesystem => "filesystem",
            ServerCategory::Memory => "memory",
            ServerCategory::Search => "search",
            ServerCategory::Github => "github",
            ServerCategory::Browser => "browser",
            ServerCategory::Email => "email",
            ServerCategory::Calendar => "calendar",
            ServerCategory::Airbnb => "airbnb",
            ServerCategory::Elevenlabs => "elevenlabs",
            ServerCategory::Other => "other",
        };
        f.write_str(label)
    }
}

/// Classifies a server from substrings of its name. First match wins.
pub fn categorize_server(name: &str) -> ServerCategory {
    let lower = name.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["file"]) {
        ServerCategory::Filesystem
    } else if has(&["duck", "search", "fire", "crawl"]) {
        ServerCategory::Search
    } else if has(&["memory", "graph"]) {
        ServerCategory::Memory
    } else if has(&["git"]) {
        ServerCategory::Github
    } else if has(&["brows", "play"]) {
        ServerCategory::Browser
    } else if has(&["mail"]) {
        ServerCategory::Email
    } else if has(&["calendar", "outlook"]) {
        ServerCategory::Calendar
    } else if has(&["airbnb"]) {
        ServerCategory::Airbnb
    } else if has(&["eleven"]) {
        ServerCategory::Elevenlabs
    } else {
        ServerCategory::Other
    }
}

/// How a tier is chosen for entries that do not declare one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierInference {
    /// Tier equals the declaration index.
    #[default]
    Declaration,
    /// Tier comes from [`categorize_server`].
    Category,
}

fn default_true() -> bool {
    true
}

/// One provider entry as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Program to launch.
    #[serde(alias = "launchCommand")]
    pub command: String,
    /// Arguments to the program.
    #[serde(default, alias = "launchArgs")]
    pub args: Vec<String>,
    /// Extra environment for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory, if not inherited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Explicit tier. Inferred when absent.
    #[serde(default, alias = "priorityTier", skip_serializing_if = "Option::is_none")]
    pub tier: Option<u32>,
    /// Failure aborts a fail-fast run.
    #[serde(default)]
    pub essential: bool,
    /// Disabled entries are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Declarative description of one provider. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSpec {
    /// Unique name, as declared in configuration.
    pub name: String,
    /// How to start the provider.
    pub launch: LaunchDescriptor,
    /// Lower tiers initialize first.
    pub tier: u32,
    /// Whether a failure of this provider aborts a fail-fast run.
    pub essential: bool,
    /// Position in the configuration. Breaks ties between equal tiers.
    pub order: usize,
    /// Why the configuration entry could not be used, if it was malformed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defect: Option<String>,
}

impl ProviderSpec {
    /// A spec at tier 0 with default flags.
    pub fn new(name: impl Into<String>, launch: LaunchDescriptor) -> Self {
        Self {
            name: name.into(),
            launch,
            tier: 0,
            essential: false,
            order: 0,
            defect: None,
        }
    }

    /// Sets the tier.
    pub fn with_tier(mut self, tier: u32) -> Self {
        self.tier = tier;
        self
    }

    /// Marks the spec essential.
    pub fn with_essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }

    /// Sets the declaration index.
    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    /// A spec for an entry that failed to parse. It fails on its first attempt.
    pub fn defective(name: impl Into<String>, order: usize, defect: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            launch: LaunchDescriptor::default(),
            tier: u32::try_from(order).unwrap_or(u32::MAX),
            essential: false,
            order,
            defect: Some(defect.into()),
        }
    }

    /// Build a spec from a parsed configuration entry.
    pub fn from_entry(
        name: &str,
        entry: ProviderEntry,
        order: usize,
        inference: TierInference,
    ) -> Self {
        let tier = entry.tier.unwrap_or_else(|| match inference {
            TierInference::Declaration => u32::try_from(order).unwrap_or(u32::MAX),
            TierInference::Category => categorize_server(name).tier(),
        });
        Self {
            name: name.to_string(),
            launch: LaunchDescriptor {
                command: entry.command,
                args: entry.args,
                env: entry.env,
                cwd: entry.cwd,
            },
            tier,
            essential: entry.essential,
            order,
            defect: None,
        }
    }

    /// Category implied by the name.
    pub fn category(&self) -> ServerCategory {
        categorize_server(&self.name)
    }

    /// Checks the spec can be launched at all. Failures are configuration errors.
    pub fn validate(&self) -> MusterResult<()> {
        if let Some(defect) = &self.defect {
            return Err(MusterError::Config(format!(
                "provider '{}': {defect}",
                self.name
            )));
        }
        if self.name.trim().is_empty() {
            return Err(MusterError::Config("provider name is empty".into()));
        }
        if self.launch.command.trim().is_empty() {
            return Err(MusterError::Config(format!(
                "provider '{}': launch command is empty",
                self.name
            )));
        }
        Ok(())
    }
}

/// The ordered set of provider specs for one run.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    specs: Vec<ProviderSpec>,
}

impl ProviderRegistry {
    /// Creates a registry. Names must be unique.
    pub fn new(specs: Vec<ProviderSpec>) -> MusterResult<Self> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(MusterError::Config(format!(
                    "duplicate provider name '{}'",
                    spec.name
                )));
            }
        }
        Ok(Self { specs })
    }

    /// Builds specs from raw `(name, entry)` pairs in declaration order.
    ///
    /// Entries that fail to parse still produce a spec carrying the defect;
    /// disabled entries are skipped but keep their declaration index.
    pub fn from_entries(
        entries: &[(String, serde_json::Value)],
        inference: TierInference,
    ) -> MusterResult<Self> {
        let mut specs = Vec::with_capacity(entries.len());
        for (order, (name, raw)) in entries.iter().enumerate() {
            match serde_json::from_value::<ProviderEntry>(raw.clone()) {
                Ok(entry) if !entry.enabled => {
                    tracing::debug!(server = %name, "Provider disabled in configuration");
                }
                Ok(entry) => specs.push(ProviderSpec::from_entry(name, entry, order, inference)),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "Malformed provider entry");
                    specs.push(ProviderSpec::defective(name, order, e.to_string()));
                }
            }
        }
        Self::new(specs)
    }

    /// Specs in declaration order.
    pub fn specs(&self) -> &[ProviderSpec] {
        &self.specs
    }

    /// Spec named `name`, if declared.
    pub fn get(&self, name: &str) -> Option<&ProviderSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Provider names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Number of specs.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no provider is declared.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
