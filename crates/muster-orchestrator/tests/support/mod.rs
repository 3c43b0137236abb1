//! Scripted in-memory providers for driving the orchestrator without
//! subprocesses.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use muster_core::{MusterError, MusterResult};
use muster_mcp::{InitializeResult, LaunchDescriptor, McpToolDef, ProviderLauncher, ToolProvider};
use muster_orchestrator::{ProviderRegistry, ProviderSpec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// `launch` itself fails.
    Launch,
    /// The handshake fails with a retryable transport error.
    Transport,
    /// The handshake fails with a non-retryable protocol error.
    Protocol,
    /// The handshake never answers.
    Hang,
}

/// How one scripted provider behaves across attempts.
#[derive(Debug, Clone)]
pub struct Script {
    pub fail_first: u32,
    pub failure: Failure,
    pub tools: Vec<String>,
    pub handshake_delay: Duration,
}

impl Script {
    pub fn ok(tools: &[&str]) -> Self {
        Self {
            fail_first: 0,
            failure: Failure::Transport,
            tools: tools.iter().map(|t| t.to_string()).collect(),
            handshake_delay: Duration::ZERO,
        }
    }

    /// Fails the first `n` attempts with `failure`, then succeeds.
    pub fn flaky(n: u32, failure: Failure, tools: &[&str]) -> Self {
        Self {
            fail_first: n,
            failure,
            ..Self::ok(tools)
        }
    }

    /// Fails every attempt with `failure`.
    pub fn broken(failure: Failure) -> Self {
        Self::flaky(u32::MAX, failure, &[])
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }
}

/// Shared timeline of what every scripted provider did.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    /// Index of the last occurrence of `event`.
    pub fn last(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().rposition(|e| e == event)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct ScriptedProvider {
    name: String,
    fail: Option<Failure>,
    tools: Vec<String>,
    handshake_delay: Duration,
    closed: AtomicBool,
    log: EventLog,
}

#[async_trait]
impl ToolProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handshake(&self) -> MusterResult<InitializeResult> {
        self.log.push(format!("handshake:{}", self.name));
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        match self.fail {
            Some(Failure::Transport) => {
                self.log.push(format!("failed:{}", self.name));
                Err(MusterError::Transport {
                    provider: self.name.clone(),
                    reason: "server closed stdout".into(),
                })
            }
            Some(Failure::Protocol) => {
                self.log.push(format!("failed:{}", self.name));
                Err(MusterError::Protocol {
                    provider: self.name.clone(),
                    reason: "unsupported protocol version '1999-01-01'".into(),
                })
            }
            Some(Failure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("hanging handshake must be abandoned by its timeout")
            }
            Some(Failure::Launch) | None => Ok(serde_json::from_value(serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.name, "version": "test"}
            }))
            .unwrap()),
        }
    }

    async fn list_tools(&self) -> MusterResult<Vec<McpToolDef>> {
        self.log.push(format!("ready:{}", self.name));
        Ok(self
            .tools
            .iter()
            .map(|t| {
                serde_json::from_value(serde_json::json!({
                    "name": t,
                    "description": format!("{t} from {}", self.name)
                }))
                .unwrap()
            })
            .collect())
    }

    async fn close(&self) -> MusterResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.log.push(format!("close:{}", self.name));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Launcher that plays back a [`Script`] per provider name.
#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: HashMap<String, Script>,
    attempts: Mutex<HashMap<String, u32>>,
    launched: Mutex<Vec<Arc<ScriptedProvider>>>,
    pub log: EventLog,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, name: &str, script: Script) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    /// Launch calls made for `name`.
    pub fn launches(&self, name: &str) -> u32 {
        self.attempts.lock().get(name).copied().unwrap_or(0)
    }

    pub fn total_launches(&self) -> u32 {
        self.attempts.lock().values().sum()
    }

    /// Handles that were launched and never closed.
    pub fn open_handles(&self) -> Vec<String> {
        self.launched
            .lock()
            .iter()
            .filter(|p| !p.is_closed())
            .map(|p| p.name.clone())
            .collect()
    }
}

#[async_trait]
impl ProviderLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        name: &str,
        _launch: &LaunchDescriptor,
    ) -> MusterResult<Arc<dyn ToolProvider>> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(name.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.log.push(format!("launch:{name}"));

        let script = self
            .scripts
            .get(name)
            .cloned()
            .unwrap_or_else(|| Script::ok(&[]));
        let fail = (attempt <= script.fail_first).then_some(script.failure);

        if fail == Some(Failure::Launch) {
            self.log.push(format!("failed:{name}"));
            return Err(MusterError::Launch {
                provider: name.to_string(),
                reason: "No such file or directory".into(),
            });
        }

        let provider = Arc::new(ScriptedProvider {
            name: name.to_string(),
            fail,
            tools: script.tools,
            handshake_delay: script.handshake_delay,
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        });
        self.launched.lock().push(provider.clone());
        Ok(provider)
    }
}

/// `(name, tier)` pairs in declaration order.
pub fn registry(specs: &[(&str, u32)]) -> ProviderRegistry {
    ProviderRegistry::new(
        specs
            .iter()
            .enumerate()
            .map(|(order, (name, tier))| {
                ProviderSpec::new(*name, LaunchDescriptor::new("scripted"))
                    .with_tier(*tier)
                    .with_order(order)
            })
            .collect(),
    )
    .unwrap()
}
