//! Core error definitions for the nexus connection core.
//!
//! This crate provides the error taxonomy shared by every nexus crate.
//!
//! # Main types
//!
//! - [`NexusError`]: Unified error enum for connections, the manager and configuration.
//! - [`ErrorCode`]: Machine-readable code carried by every error.
//! - [`NexusResult`]: Convenience alias for `Result<T, NexusError>`.

mod error;

pub use error::{ErrorCode, NexusError, NexusResult};
