//! MCP (Model Context Protocol) plumbing for muster.
//!
//! [`ToolProvider`] is the capability the orchestrator depends on;
//! [`StdioLauncher`] brings providers up as subprocesses speaking
//! JSON-RPC over stdin/stdout.

/// JSON-RPC and MCP wire types.
pub mod protocol;
/// Provider and launcher traits.
pub mod provider;
/// Stdio transport.
pub mod stdio;

pub use protocol::{InitializeResult, McpToolDef};
pub use provider::{LaunchDescriptor, ProviderLauncher, ToolProvider};
pub use stdio::{StdioLauncher, StdioProvider};
