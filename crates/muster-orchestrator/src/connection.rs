use crate::aggregator::ProviderRank;
use crate::backoff::RetryPolicy;
use crate::guardian::{ResourceGuardian, ResourceId};
use crate::spec::ProviderSpec;
use muster_core::{MusterError, MusterResult, ToolDescriptor};
use muster_mcp::{ProviderLauncher, ToolProvider};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of one provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not attempted yet.
    Pending,
    /// An attempt is in flight.
    Connecting,
    /// Handshake done and tools listed.
    Ready,
    /// Out of attempts, or a permanent error.
    Failed,
    /// Released after being Ready.
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Closed => "closed",
        };
        f.pad(label)
    }
}

/// One provider's connection and what it discovered.
///
/// While `Ready` the connection exclusively owns the live handle; the
/// guardian only holds a weak reference to it.
pub struct Connection {
    /// Provider name.
    pub name: String,
    /// Initialization tier.
    pub tier: u32,
    /// Declaration index.
    pub order: usize,
    /// Whether a failure aborts a fail-fast run.
    pub essential: bool,
    /// Current lifecycle state.
    pub status: ConnectionStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// Error from the last failed attempt.
    pub last_error: Option<MusterError>,
    /// Tools discovered while Ready.
    pub tools: Vec<ToolDescriptor>,
    handle: Option<Arc<dyn ToolProvider>>,
    resource: Option<ResourceId>,
}

impl Connection {
    /// A connection that has not been attempted yet.
    pub fn pending(spec: &ProviderSpec) -> Self {
        Self {
            name: spec.name.clone(),
            tier: spec.tier,
            order: spec.order,
            essential: spec.essential,
            status: ConnectionStatus::Pending,
            attempts: 0,
            last_error: None,
            tools: Vec::new(),
            handle: None,
            resource: None,
        }
    }

    /// Collision priority of this provider.
    pub fn rank(&self) -> ProviderRank {
        ProviderRank::new(self.tier, self.order)
    }

    /// Whether the connection is Ready.
    pub fn is_ready(&self) -> bool {
        self.status == ConnectionStatus::Ready
    }

    /// The live provider, while the connection is Ready.
    pub fn handle(&self) -> Option<&Arc<dyn ToolProvider>> {
        self.handle.as_ref()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("last_error", &self.last_error.as_ref().map(ToString::to_string))
            .field("tools", &self.tools.len())
            .finish()
    }
}

/// Drives one provider from Pending to Ready or Failed.
#[derive(Clone)]
pub struct ConnectionManager {
    launcher: Arc<dyn ProviderLauncher>,
    guardian: Arc<ResourceGuardian>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    /// A manager launching through `launcher`.
    pub fn new(
        launcher: Arc<dyn ProviderLauncher>,
        guardian: Arc<ResourceGuardian>,
        retry: RetryPolicy,
        cancel: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            guardian,
            retry,
            cancel,
            shutdown_timeout,
        }
    }

    /// Connect to `spec`, retrying transient failures up to `max_attempts`.
    ///
    /// Never returns an error: failures are folded into the connection.
    /// A connection cancelled before its first attempt stays Pending.
    pub async fn initialize(
        &self,
        spec: &ProviderSpec,
        max_attempts: u32,
        per_attempt_timeout: Duration,
    ) -> Connection {
        let mut conn = Connection::pending(spec);

        if let Err(e) = spec.validate() {
            warn!(server = %spec.name, error = %e, "Invalid provider configuration");
            conn.attempts = 1;
            conn.status = ConnectionStatus::Failed;
            conn.last_error = Some(e);
            return conn;
        }

        let max_attempts = max_attempts.max(1);
        loop {
            if self.cancel.is_cancelled() {
                if conn.attempts > 0 {
                    conn.status = ConnectionStatus::Failed;
                }
                return conn;
            }

            conn.attempts += 1;
            conn.status = ConnectionStatus::Connecting;
            info!(
                server = %spec.name,
                tier = spec.tier,
                attempt = conn.attempts,
                max_attempts,
                "Connecting to provider"
            );

            let err = match self.attempt(spec, per_attempt_timeout).await {
                Ok((handle, resource, tools)) => {
                    info!(
                        server = %spec.name,
                        attempts = conn.attempts,
                        tools = tools.len(),
                        "Provider ready"
                    );
                    conn.handle = Some(handle);
                    conn.resource = Some(resource);
                    conn.tools = tools;
                    conn.status = ConnectionStatus::Ready;
                    conn.last_error = None;
                    return conn;
                }
                Err(e) => e,
            };

            let retry = err.is_retryable() && conn.attempts < max_attempts;
            warn!(
                server = %spec.name,
                attempt = conn.attempts,
                max_attempts,
                error = %err,
                retry,
                "Provider attempt failed"
            );
            conn.last_error = Some(err);

            if !retry {
                conn.status = ConnectionStatus::Failed;
                return conn;
            }

            let delay = self.retry.delay(conn.attempts);
            debug!(server = %spec.name, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    conn.status = ConnectionStatus::Failed;
                    conn.last_error = Some(cancelled(&spec.name));
                    return conn;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One launch → handshake → manifest pass. Cleans up after itself on failure.
    async fn attempt(
        &self,
        spec: &ProviderSpec,
        timeout: Duration,
    ) -> MusterResult<(Arc<dyn ToolProvider>, ResourceId, Vec<ToolDescriptor>)> {
        let name = spec.name.as_str();
        let handle = self
            .bounded(name, timeout, self.launcher.launch(name, &spec.launch))
            .await?;
        let resource = self.guardian.track(&handle);

        let discovered = async {
            self.bounded(name, timeout, handle.handshake()).await?;
            let defs = self.bounded(name, timeout, handle.list_tools()).await?;
            Ok::<_, MusterError>(
                defs.into_iter()
                    .map(|d| d.into_descriptor(name))
                    .collect::<Vec<_>>(),
            )
        }
        .await;

        match discovered {
            Ok(tools) => Ok((handle, resource, tools)),
            Err(e) => {
                self.guardian.release_one(resource).await;
                Err(e)
            }
        }
    }

    /// Runs `fut` under `timeout`, abandoning it if the run is cancelled.
    async fn bounded<T, F>(&self, provider: &str, timeout: Duration, fut: F) -> MusterResult<T>
    where
        F: Future<Output = MusterResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled(provider)),
            res = tokio::time::timeout(timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(MusterError::HandshakeTimeout {
                    provider: provider.to_string(),
                    timeout,
                }),
            },
        }
    }

    /// Tear down `conn`. Safe in every status and on repeated calls.
    pub async fn close(&self, conn: &mut Connection) {
        if let Some(id) = conn.resource.take() {
            self.guardian.release_one(id).await;
        }
        if let Some(handle) = conn.handle.take() {
            if !handle.is_closed() {
                match tokio::time::timeout(self.shutdown_timeout, handle.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(server = %conn.name, error = %e, "Error closing provider"),
                    Err(_) => warn!(server = %conn.name, "Timed out closing provider"),
                }
            }
        }
        if matches!(
            conn.status,
            ConnectionStatus::Ready | ConnectionStatus::Connecting
        ) {
            conn.status = ConnectionStatus::Closed;
            debug!(server = %conn.name, "Connection closed");
        }
    }
}

fn cancelled(provider: &str) -> MusterError {
    MusterError::Cancelled(format!("initialization of '{provider}' cancelled"))
}
