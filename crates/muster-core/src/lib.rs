//! Core types and error definitions for muster.
//!
//! This crate provides the foundational types shared by the transport,
//! orchestrator and CLI crates.
//!
//! # Main types
//!
//! - [`MusterError`]: Unified error enum, classified as retryable or not.
//! - [`MusterResult`]: Convenience alias for `Result<T, MusterError>`.
//! - [`ToolDescriptor`]: A single capability offered by a provider.

/// Error taxonomy.
pub mod error;
/// Tool descriptors.
pub mod tool;

pub use error::{MusterError, MusterResult};
pub use tool::ToolDescriptor;
