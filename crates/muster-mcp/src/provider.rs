//! The transport-independent provider capability.
//!
//! The orchestrator only ever talks to `dyn ToolProvider`; each transport
//! contributes a [`ProviderLauncher`] that knows how to bring one up.

use crate::protocol::{InitializeResult, McpToolDef};
use async_trait::async_trait;
use muster_core::MusterResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// How to start a provider. Opaque to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory, if different from the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl LaunchDescriptor {
    /// A descriptor with no arguments or environment overrides.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Appends arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A live connection to one provider.
///
/// Implementations must make `close` idempotent and safe to call at any
/// point, including before `handshake` was attempted.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Provider name, as declared in configuration.
    fn name(&self) -> &str;

    /// Negotiates capabilities. Completes the `initialize` exchange.
    async fn handshake(&self) -> MusterResult<InitializeResult>;

    /// Queries the tool manifest.
    async fn list_tools(&self) -> MusterResult<Vec<McpToolDef>>;

    /// Releases every OS resource held by the provider.
    async fn close(&self) -> MusterResult<()>;

    /// Whether `close` has already run.
    fn is_closed(&self) -> bool;
}

/// Creates [`ToolProvider`]s for one transport.
#[async_trait]
pub trait ProviderLauncher: Send + Sync {
    /// Starts the provider described by `launch`. Does not handshake.
    async fn launch(
        &self,
        name: &str,
        launch: &LaunchDescriptor,
    ) -> MusterResult<Arc<dyn ToolProvider>>;
}
