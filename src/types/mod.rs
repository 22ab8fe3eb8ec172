//! Core types for the DiPeO execution core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (NodeId, EdgeId, ExecutionId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Engine configuration with environment overrides

mod config;
mod errors;
mod ids;

pub use config::EngineConfig;
pub use errors::{Error, ErrorClass, LlmErrorKind, Result};
pub use ids::{EdgeId, ExecutionId, HandleId, MessageId, NodeId, PersonId};
