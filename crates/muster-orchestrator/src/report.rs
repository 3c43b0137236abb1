use crate::aggregator::Collision;
use crate::connection::{Connection, ConnectionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall result of an initialization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every provider in the working set is Ready.
    Success,
    /// At least one provider is Ready and at least one failed.
    PartialFailure,
    /// Fail-fast tore the run down after `provider` failed in `tier`.
    Aborted {
        /// Tier the failure happened in.
        tier: u32,
        /// The provider that failed.
        provider: String,
    },
    /// Nothing came up and fallback was not used.
    NoProviders,
    /// The operator cancelled the run.
    Cancelled,
    /// The built-in fallback set replaced external providers.
    Fallback,
}

impl RunOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Success | RunOutcome::PartialFailure | RunOutcome::Fallback => 0,
            RunOutcome::Aborted { .. } => 1,
            RunOutcome::NoProviders => 2,
            RunOutcome::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::PartialFailure => write!(f, "partial failure"),
            RunOutcome::Aborted { tier, provider } => {
                write!(f, "aborted at tier {tier} ('{provider}' failed)")
            }
            RunOutcome::NoProviders => write!(f, "no providers"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Fallback => write!(f, "fallback"),
        }
    }
}

/// Terminal state of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReport {
    /// Provider name.
    pub name: String,
    /// Initialization tier.
    pub tier: u32,
    /// Terminal status.
    pub status: ConnectionStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Last error message, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Short error class, e.g. `timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Tools discovered while Ready.
    pub tool_count: usize,
}

impl ProviderReport {
    /// Snapshot of `conn` as it ended.
    pub fn from_connection(conn: &Connection) -> Self {
        Self {
            name: conn.name.clone(),
            tier: conn.tier,
            status: conn.status,
            attempts: conn.attempts,
            error: conn.last_error.as_ref().map(ToString::to_string),
            error_kind: conn.last_error.as_ref().map(|e| e.kind().to_string()),
            tool_count: conn.tools.len(),
        }
    }
}

/// What happened during one run. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationReport {
    /// One entry per provider in the working set, in tier then declaration order.
    pub entries: Vec<ProviderReport>,
    /// Duplicate tool names and who kept them.
    pub collisions: Vec<Collision>,
    /// Entries that could not be used at all.
    pub config_errors: Vec<String>,
    /// Overall result.
    #[serde(flatten)]
    pub outcome: RunOutcome,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl InitializationReport {
    /// Exit status for the run outcome.
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }

    /// Entry for `name`, if it was in the working set.
    pub fn entry(&self, name: &str) -> Option<&ProviderReport> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Names of providers that ended Ready.
    pub fn ready(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.status == ConnectionStatus::Ready)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Names of providers that ended Failed.
    pub fn failed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.status == ConnectionStatus::Failed)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Multi-line human summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Initialization {} ({} ready, {} failed)\n",
            self.outcome,
            self.ready().len(),
            self.failed().len()
        );
        for e in &self.entries {
            out.push_str(&format!(
                "  [tier {}] {:<20} {:<10} attempts={} tools={}",
                e.tier,
                e.name,
                e.status,
                e.attempts,
                e.tool_count
            ));
            if let Some(err) = &e.error {
                out.push_str(&format!(" error={err}"));
            }
            out.push('\n');
        }
        for c in &self.collisions {
            out.push_str(&format!(
                "  collision: '{}' kept from {}, dropped from {}\n",
                c.tool, c.kept, c.dropped
            ));
        }
        for err in &self.config_errors {
            out.push_str(&format!("  config: {err}\n"));
        }
        out
    }
}
