//! Launches the downstream agent runtime with the final capability view.

use anyhow::Context;
use muster_orchestrator::{AgentInstructionContext, AgentSettings, AggregatedToolSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Rendered instruction text for the agent.
pub const INSTRUCTIONS_ENV: &str = "MUSTER_INSTRUCTIONS";
/// JSON array of every available tool descriptor.
pub const MANIFEST_ENV: &str = "MUSTER_TOOL_MANIFEST";

/// How the agent runtime ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Exited on its own with this status (`None` when killed by a signal).
    Exited(Option<i32>),
    /// Stopped because the run was cancelled.
    Cancelled,
}

/// Environment handed to the agent runtime.
pub fn agent_env(
    instructions: &AgentInstructionContext,
    tools: &AggregatedToolSet,
) -> anyhow::Result<Vec<(&'static str, String)>> {
    Ok(vec![
        (INSTRUCTIONS_ENV, instructions.text.clone()),
        (MANIFEST_ENV, serde_json::to_string(&tools.to_manifest())?),
    ])
}

/// Run the configured agent until it exits or `cancel` fires.
///
/// Providers stay alive for the whole call; the caller releases them.
pub async fn run_agent(
    agent: &AgentSettings,
    instructions: &AgentInstructionContext,
    tools: &AggregatedToolSet,
    cancel: CancellationToken,
) -> anyhow::Result<AgentExit> {
    let command = agent
        .command
        .as_deref()
        .context("no agent command configured")?;

    let mut child = tokio::process::Command::new(command)
        .args(&agent.args)
        .envs(agent_env(instructions, tools)?)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start agent runtime '{command}'"))?;

    info!(command, pid = ?child.id(), tools = tools.len(), "Agent runtime started");

    tokio::select! {
        status = child.wait() => {
            let status = status.context("failed to wait for agent runtime")?;
            info!(%status, "Agent runtime exited");
            Ok(AgentExit::Exited(status.code()))
        }
        _ = cancel.cancelled() => {
            warn!("Stopping agent runtime");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill agent runtime");
            }
            Ok(AgentExit::Cancelled)
        }
    }
}

/// Combine the run's exit status with how the agent ended.
pub fn exit_code(run_code: u8, agent: Option<AgentExit>) -> u8 {
    match agent {
        None => run_code,
        Some(AgentExit::Cancelled) => 130,
        Some(AgentExit::Exited(Some(0))) => run_code,
        Some(AgentExit::Exited(Some(code))) => u8::try_from(code).unwrap_or(1),
        Some(AgentExit::Exited(None)) => 1,
    }
}
