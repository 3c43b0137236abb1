//! Multi-provider initialization orchestrator.
//!
//! Starts MCP tool providers tier by tier, retries transient failures,
//! merges their tools into one namespace and guarantees every opened
//! resource is released.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Entry point; `start` returns a [`RunContext`].
//! - [`ProviderRegistry`]: Ordered provider specs loaded from configuration.
//! - [`ConnectionManager`]: Lifecycle of one provider connection.
//! - [`Scheduler`]: Tier sequencing and failure policy.
//! - [`ToolAggregator`]: Collision-resolving tool namespace.
//! - [`ResourceGuardian`]: Reverse-order, idempotent teardown.
//! - [`InitializationReport`]: What happened, per provider.

/// Tool namespace merging.
pub mod aggregator;
/// Agent instruction rendering.
pub mod announcer;
/// Retry delays.
pub mod backoff;
/// Tool cache persistence.
pub mod cache;
/// Configuration file schema.
pub mod config;
/// Single-provider lifecycle.
pub mod connection;
/// Orchestrator entry point and run context.
pub mod engine;
/// Built-in fallback tool set.
pub mod fallback;
/// Resource tracking and teardown.
pub mod guardian;
/// Initialization report.
pub mod report;
/// Tier scheduling.
pub mod scheduler;
/// Provider specs and registry.
pub mod spec;

pub use aggregator::{AggregatedToolSet, Collision, ProviderRank, ToolAggregator};
pub use announcer::{render, AgentInstructionContext};
pub use backoff::{BackoffStrategy, RetryPolicy};
pub use cache::ToolCache;
pub use config::{AgentSettings, MusterConfig, OrchestratorSettings};
pub use connection::{Connection, ConnectionManager, ConnectionStatus};
pub use engine::{Invocation, Orchestrator, RunContext};
pub use fallback::FallbackProvider;
pub use guardian::{ResourceGuardian, ResourceId};
pub use report::{InitializationReport, ProviderReport, RunOutcome};
pub use scheduler::{AbortOn, FailureMode, RunPolicy, Scheduler, SchedulerRun};
pub use spec::{categorize_server, ProviderRegistry, ProviderSpec, ServerCategory, TierInference};
