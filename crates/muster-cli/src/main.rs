mod handoff;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use handoff::AgentExit;
use muster_mcp::StdioLauncher;
use muster_orchestrator::{Invocation, MusterConfig, Orchestrator, OrchestratorSettings, ToolCache};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILES: [&str; 2] = ["muster.toml", "mcp_config.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(
    name = "muster",
    about = "Muster: bring up MCP tool providers and hand their tools to an agent"
)]
struct Cli {
    /// Only start these providers
    servers: Vec<String>,

    /// Path to config file (muster.toml or mcp_config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Restrict the run to the configured safe providers
    #[arg(long)]
    safe_mode: bool,

    /// Abort and release everything on the first provider failure
    #[arg(long)]
    fail_fast: bool,

    /// Attempts per provider, including the first
    #[arg(long, visible_alias = "max-attempts")]
    retry: Option<u32>,

    /// Seconds allowed for each launch and handshake
    #[arg(long)]
    timeout: Option<u64>,

    /// Skip every provider and use the built-in tool set
    #[arg(long)]
    fallback_only: bool,

    /// Initialize, print the report and exit
    #[arg(long)]
    init_only: bool,

    /// Exit with an error instead of falling back when nothing starts
    #[arg(long)]
    no_auto_fallback: bool,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

impl Cli {
    fn invocation(&self) -> Invocation {
        Invocation {
            server_filter: self.servers.clone(),
            safe_mode: self.safe_mode,
            fail_fast: self.fail_fast,
            max_attempts: self.retry,
            attempt_timeout: self.timeout.map(Duration::from_secs),
            fallback_only: self.fallback_only,
            init_only: self.init_only,
            auto_fallback: self.no_auto_fallback.then_some(false),
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// The explicit path, else the first default file present in `dir`.
fn resolve_config(explicit: Option<&Path>, dir: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Stdio launcher whose request bound follows the same timeout the run uses.
fn launcher_for(settings: &OrchestratorSettings, invocation: &Invocation) -> StdioLauncher {
    StdioLauncher::new()
        .with_request_timeout(
            invocation
                .attempt_timeout
                .unwrap_or_else(|| settings.attempt_timeout()),
        )
        .with_shutdown_timeout(settings.shutdown_timeout())
}

async fn load_config(cli: &Cli) -> anyhow::Result<MusterConfig> {
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    match resolve_config(cli.config.as_deref(), &cwd) {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            MusterConfig::load(&path)
                .await
                .with_context(|| format!("failed to load config file '{}'", path.display()))
        }
        None if cli.fallback_only => Ok(MusterConfig::default()),
        None => anyhow::bail!(
            "no config file found (looked for {}); pass --config",
            DEFAULT_CONFIG_FILES.join(", ")
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Ok(path) = dotenvy::dotenv() {
        info!(path = %path.display(), "Loaded environment file");
    }

    let config = load_config(&cli).await?;
    let registry = config.registry()?;
    let settings = config.orchestrator.clone();
    let invocation = cli.invocation();
    let launcher = launcher_for(&settings, &invocation);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, shutting down");
                cancel.cancel();
            }
        })
    };

    let orchestrator = Orchestrator::new(Arc::new(launcher), settings.clone())
        .with_cancellation(cancel.clone());

    info!(
        providers = registry.len(),
        fallback_only = invocation.fallback_only,
        "Starting provider initialization"
    );
    let mut ctx = orchestrator.start(&registry, &invocation).await;
    eprintln!("{}", ctx.report.summary());

    if let Some(path) = &settings.tool_cache {
        let cache = ToolCache::from_set(&ctx.tools);
        if let Err(e) = cache.write(path).await {
            warn!(path = %path.display(), error = %e, "Failed to write tool cache");
        }
    }

    let mut agent_exit = None;
    if ctx.report.exit_code() == 0 {
        if let Some(instructions) = &ctx.instructions {
            if config.agent.command.is_some() {
                match handoff::run_agent(&config.agent, instructions, &ctx.tools, cancel.clone())
                    .await
                {
                    Ok(exit) => agent_exit = Some(exit),
                    Err(e) => {
                        error!(error = %e, "Agent runtime failed");
                        agent_exit = Some(AgentExit::Exited(None));
                    }
                }
            } else {
                println!("{}", instructions.text);
            }
        }
    }

    let released = ctx.shutdown().await;
    info!(released, "Providers released");
    ctrl_c.abort();

    Ok(ExitCode::from(handoff::exit_code(
        ctx.report.exit_code(),
        agent_exit,
    )))
}
