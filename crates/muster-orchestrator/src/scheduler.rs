use crate::aggregator::ToolAggregator;
use crate::announcer::{render, AgentInstructionContext};
use crate::connection::{Connection, ConnectionManager, ConnectionStatus};
use crate::guardian::ResourceGuardian;
use crate::report::{InitializationReport, ProviderReport, RunOutcome};
use crate::spec::ProviderSpec;
use chrono::Utc;
use futures_util::future::join_all;
use muster_core::MusterError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What a failed provider does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Record the failure and keep going.
    #[default]
    ContinueOnError,
    /// Tear everything down and stop.
    FailFast,
}

/// Which failures trigger a fail-fast abort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortOn {
    /// Only providers marked `essential`.
    Essential,
    /// Any provider.
    #[default]
    Any,
}

/// Knobs for one scheduler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPolicy {
    /// What a failure does to the rest of the run.
    pub failure_mode: FailureMode,
    /// Which failures abort.
    pub abort_on: AbortOn,
    /// Restrict the run to these providers. Empty means all.
    pub server_filter: Vec<String>,
    /// Attempts per provider, including the first.
    pub max_attempts: u32,
    /// Restrict the run to safe providers.
    pub safe_mode: bool,
    /// Providers allowed in safe mode.
    pub safe_servers: Vec<String>,
    /// Tiers at or below this are also safe.
    pub safe_max_tier: Option<u32>,
    /// Bound on each launch and handshake.
    pub per_attempt_timeout: Duration,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            abort_on: AbortOn::default(),
            server_filter: Vec::new(),
            max_attempts: 3,
            safe_mode: false,
            safe_servers: Vec::new(),
            safe_max_tier: None,
            per_attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RunPolicy {
    fn is_safe(&self, spec: &ProviderSpec) -> bool {
        self.safe_servers.iter().any(|s| s == &spec.name)
            || self.safe_max_tier.is_some_and(|max| spec.tier <= max)
    }

    fn triggers_abort(&self, conn: &Connection) -> bool {
        self.failure_mode == FailureMode::FailFast
            && conn.status == ConnectionStatus::Failed
            && !matches!(conn.last_error, Some(MusterError::Cancelled(_)))
            && (self.abort_on == AbortOn::Any || conn.essential)
    }
}

/// Result of [`Scheduler::run`]: the report plus every connection it produced.
#[derive(Debug)]
pub struct SchedulerRun {
    /// What happened, per provider.
    pub report: InitializationReport,
    /// In tier then declaration order.
    pub connections: Vec<Connection>,
}

/// Picks the providers a run will touch.
///
/// Returns the working set in tier then declaration order, plus configuration
/// errors for filter names that match no spec.
pub fn select_working_set<'a>(
    specs: &'a [ProviderSpec],
    policy: &RunPolicy,
) -> (Vec<&'a ProviderSpec>, Vec<String>) {
    let mut config_errors = Vec::new();
    let mut working: Vec<&ProviderSpec> = specs.iter().collect();

    if policy.safe_mode {
        working.retain(|s| policy.is_safe(s));
        if working.is_empty() {
            warn!("Safe mode matched no configured provider");
        } else {
            info!(
                providers = ?working.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "Safe mode enabled"
            );
        }
    }

    if !policy.server_filter.is_empty() {
        for name in &policy.server_filter {
            if !specs.iter().any(|s| &s.name == name) {
                warn!(server = %name, "Requested provider is not configured");
                config_errors.push(format!("unknown provider '{name}'"));
            }
        }

        let filtered: Vec<&ProviderSpec> = working
            .iter()
            .copied()
            .filter(|s| policy.server_filter.contains(&s.name))
            .collect();

        if filtered.is_empty() && policy.safe_mode && !working.is_empty() {
            warn!("Requested providers are outside the safe set, using the safe set instead");
        } else {
            working = filtered;
        }
    }

    working.sort_by_key(|s| (s.tier, s.order));
    (working, config_errors)
}

/// Drives connection managers tier by tier.
pub struct Scheduler {
    manager: ConnectionManager,
    aggregator: Arc<ToolAggregator>,
    guardian: Arc<ResourceGuardian>,
    cancel: CancellationToken,
    announcements: Arc<watch::Sender<AgentInstructionContext>>,
    base_instructions: String,
}

impl Scheduler {
    /// A scheduler publishing to `announcements`.
    pub fn new(
        manager: ConnectionManager,
        aggregator: Arc<ToolAggregator>,
        guardian: Arc<ResourceGuardian>,
        cancel: CancellationToken,
        announcements: Arc<watch::Sender<AgentInstructionContext>>,
        base_instructions: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            aggregator,
            guardian,
            cancel,
            announcements,
            base_instructions: base_instructions.into(),
        }
    }

    fn publish(&self) {
        let ctx = render(&self.aggregator.snapshot(), &self.base_instructions);
        self.announcements.send_replace(ctx);
    }

    /// Initialize every provider in the working set.
    ///
    /// Tiers run strictly in ascending order; providers within a tier run
    /// concurrently. The aggregated set is re-published after each tier.
    pub async fn run(&self, specs: &[ProviderSpec], policy: &RunPolicy) -> SchedulerRun {
        let started_at = Utc::now();
        let (working, config_errors) = select_working_set(specs, policy);

        let mut tiers: BTreeMap<u32, Vec<&ProviderSpec>> = BTreeMap::new();
        for &spec in &working {
            tiers.entry(spec.tier).or_default().push(spec);
        }

        let mut connections: Vec<Connection> = Vec::with_capacity(working.len());
        let mut aborted: Option<(u32, String)> = None;

        for (tier, tier_specs) in &tiers {
            if aborted.is_some() || self.cancel.is_cancelled() {
                connections.extend(tier_specs.iter().map(|s| Connection::pending(s)));
                continue;
            }

            info!(
                tier,
                providers = ?tier_specs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "Starting tier"
            );

            let results = join_all(tier_specs.iter().map(|spec| {
                self.manager
                    .initialize(spec, policy.max_attempts, policy.per_attempt_timeout)
            }))
            .await;

            for conn in results.iter().filter(|c| c.is_ready()) {
                self.aggregator.register(&conn.name, conn.rank(), &conn.tools);
            }

            if let Some(failed) = results.iter().find(|c| policy.triggers_abort(c)) {
                error!(
                    tier,
                    server = %failed.name,
                    "Provider failed under fail-fast, aborting"
                );
                aborted = Some((*tier, failed.name.clone()));
            }

            connections.extend(results);

            if aborted.is_none() {
                self.publish();
            }
        }

        // Captured before teardown clears the namespace.
        let collisions = self.aggregator.collisions();
        let cancelled = self.cancel.is_cancelled();
        let outcome = if let Some((tier, provider)) = aborted {
            self.teardown(&mut connections).await;
            RunOutcome::Aborted { tier, provider }
        } else if cancelled {
            warn!("Initialization cancelled");
            self.teardown(&mut connections).await;
            RunOutcome::Cancelled
        } else {
            let ready = connections.iter().filter(|c| c.is_ready()).count();
            if ready == 0 {
                RunOutcome::NoProviders
            } else if ready == connections.len() {
                RunOutcome::Success
            } else {
                RunOutcome::PartialFailure
            }
        };

        let report = InitializationReport {
            entries: connections.iter().map(ProviderReport::from_connection).collect(),
            collisions,
            config_errors,
            outcome,
            started_at,
            finished_at: Utc::now(),
        };
        info!(outcome = %report.outcome, ready = report.ready().len(), "Initialization finished");

        SchedulerRun {
            report,
            connections,
        }
    }

    /// Release every resource, mark live connections Closed and empty the
    /// aggregated set.
    async fn teardown(&self, connections: &mut [Connection]) {
        self.guardian.release_all().await;
        for conn in connections {
            self.manager.close(conn).await;
        }
        self.aggregator.clear();
        self.publish();
    }
}
