use crate::aggregator::{AggregatedToolSet, ToolAggregator};
use crate::announcer::{render, AgentInstructionContext, DEFAULT_BASE_INSTRUCTIONS};
use crate::config::OrchestratorSettings;
use crate::connection::{Connection, ConnectionManager};
use crate::fallback::FallbackProvider;
use crate::guardian::ResourceGuardian;
use crate::report::{InitializationReport, RunOutcome};
use crate::scheduler::{FailureMode, RunPolicy, Scheduler, SchedulerRun};
use crate::spec::ProviderRegistry;
use chrono::Utc;
use muster_mcp::ProviderLauncher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-run choices made by the caller, layered over [`OrchestratorSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Only start these providers. Empty means all.
    pub server_filter: Vec<String>,
    /// Only start safe providers.
    pub safe_mode: bool,
    /// Abort on the first failure.
    pub fail_fast: bool,
    /// Overrides `max_attempts` from settings.
    pub max_attempts: Option<u32>,
    /// Overrides the per-attempt timeout from settings.
    pub attempt_timeout: Option<Duration>,
    /// Skip every provider and use the built-in tool set.
    pub fallback_only: bool,
    /// Initialize, report, then release everything.
    pub init_only: bool,
    /// Overrides `auto_fallback` from settings.
    pub auto_fallback: Option<bool>,
}

/// Everything a run produced, handed to the consumer explicitly.
pub struct RunContext {
    /// What happened, per provider.
    pub report: InitializationReport,
    /// Final tool set, or the fallback set.
    pub tools: AggregatedToolSet,
    /// `None` after an `init_only` run.
    pub instructions: Option<AgentInstructionContext>,
    /// One per provider in the working set.
    pub connections: Vec<Connection>,
    guardian: Arc<ResourceGuardian>,
    manager: ConnectionManager,
}

impl RunContext {
    /// Tracks every resource the run opened.
    pub fn guardian(&self) -> &Arc<ResourceGuardian> {
        &self.guardian
    }

    /// Close every provider this run opened. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> usize {
        let released = self.guardian.release_all().await;
        for conn in &mut self.connections {
            self.manager.close(conn).await;
        }
        released
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("outcome", &self.report.outcome)
            .field("tools", &self.tools.len())
            .field("connections", &self.connections)
            .finish()
    }
}

/// Brings the configured providers up and derives the agent's capability view.
pub struct Orchestrator {
    launcher: Arc<dyn ProviderLauncher>,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    announcements: Arc<watch::Sender<AgentInstructionContext>>,
}

impl Orchestrator {
    /// An orchestrator with its own cancellation token.
    pub fn new(launcher: Arc<dyn ProviderLauncher>, settings: OrchestratorSettings) -> Self {
        let (tx, _rx) = watch::channel(AgentInstructionContext::default());
        Self {
            launcher,
            settings,
            cancel: CancellationToken::new(),
            announcements: Arc::new(tx),
        }
    }

    /// Use an externally owned cancellation token (e.g. wired to Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels runs of this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Settings this orchestrator was built with.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Receive every rendered instruction context, one per finished tier.
    pub fn subscribe(&self) -> watch::Receiver<AgentInstructionContext> {
        self.announcements.subscribe()
    }

    /// Builds the scheduler policy for `invocation`.
    pub fn policy_for(&self, invocation: &Invocation) -> RunPolicy {
        RunPolicy {
            failure_mode: if invocation.fail_fast {
                FailureMode::FailFast
            } else {
                FailureMode::ContinueOnError
            },
            abort_on: self.settings.abort_on,
            server_filter: invocation.server_filter.clone(),
            max_attempts: invocation
                .max_attempts
                .unwrap_or(self.settings.max_attempts)
                .max(1),
            safe_mode: invocation.safe_mode,
            safe_servers: self.settings.safe_servers.clone(),
            safe_max_tier: self.settings.safe_max_tier,
            per_attempt_timeout: invocation
                .attempt_timeout
                .unwrap_or_else(|| self.settings.attempt_timeout()),
        }
    }

    fn base_instructions(&self) -> &str {
        self.settings
            .base_instructions
            .as_deref()
            .unwrap_or(DEFAULT_BASE_INSTRUCTIONS)
    }

    /// Run initialization for `registry` and return the resulting context.
    pub async fn start(&self, registry: &ProviderRegistry, invocation: &Invocation) -> RunContext {
        let guardian = Arc::new(ResourceGuardian::new(self.settings.shutdown_timeout()));
        let manager = ConnectionManager::new(
            self.launcher.clone(),
            guardian.clone(),
            self.settings.backoff,
            self.cancel.clone(),
            self.settings.shutdown_timeout(),
        );

        let (report, connections, tools, base) = if invocation.fallback_only {
            info!("Fallback-only mode, no provider will be launched");
            let now = Utc::now();
            let report = InitializationReport {
                entries: Vec::new(),
                collisions: Vec::new(),
                config_errors: Vec::new(),
                outcome: RunOutcome::Fallback,
                started_at: now,
                finished_at: now,
            };
            (
                report,
                Vec::new(),
                FallbackProvider::capabilities(),
                FallbackProvider::base_instructions(),
            )
        } else {
            let aggregator = Arc::new(ToolAggregator::new());
            let scheduler = Scheduler::new(
                manager.clone(),
                aggregator.clone(),
                guardian.clone(),
                self.cancel.clone(),
                self.announcements.clone(),
                self.base_instructions(),
            );
            let policy = self.policy_for(invocation);
            let SchedulerRun {
                mut report,
                connections,
            } = scheduler.run(registry.specs(), &policy).await;

            let auto_fallback = invocation
                .auto_fallback
                .unwrap_or(self.settings.auto_fallback);
            if report.outcome == RunOutcome::NoProviders && auto_fallback {
                warn!("No provider came up, substituting the built-in tool set");
                report.outcome = RunOutcome::Fallback;
                (
                    report,
                    connections,
                    FallbackProvider::capabilities(),
                    FallbackProvider::base_instructions(),
                )
            } else {
                (
                    report,
                    connections,
                    aggregator.snapshot(),
                    self.base_instructions(),
                )
            }
        };

        let instructions = render(&tools, base);
        self.announcements.send_replace(instructions.clone());

        let mut ctx = RunContext {
            report,
            tools,
            instructions: Some(instructions),
            connections,
            guardian,
            manager,
        };

        if invocation.init_only {
            let released = ctx.shutdown().await;
            info!(released, "Init-only run, providers released");
            ctx.instructions = None;
        }

        ctx
    }
}
