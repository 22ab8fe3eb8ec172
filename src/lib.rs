//! # DiPeO Core - Diagram Execution Runtime
//!
//! Rust implementation of the DiPeO execution core providing:
//! - Six-phase compilation of domain diagrams into executable graphs
//! - Token-driven, epoch-aware scheduling with join policies
//! - Envelope-based message passing between typed nodes
//! - Ordered, replayable per-execution event streams
//! - A person/memory subsystem for LLM personas
//!
//! ## Architecture
//!
//! The engine follows a single-actor model per execution: one driver task
//! owns all mutable scheduling state while handler invocations run as
//! independent tasks suspending only on injected I/O ports.
//!
//! ```text
//!   DomainDiagram → Compiler → ExecutableDiagram
//!                                    │
//!                    ┌───────────────▼────────────────┐
//!                    │        Execution Driver        │
//!                    │  ┌─────────┐  ┌─────────────┐  │
//!                    │  │Scheduler│  │State Tracker│  │
//!                    │  └─────────┘  └─────────────┘  │
//!                    │  ┌─────────┐  ┌─────────────┐  │
//!                    │  │ Resolver│  │  Event Bus  │  │
//!                    │  └─────────┘  └─────────────┘  │
//!                    └───────┬────────────────────────┘
//!                            │ spawn
//!                    ┌───────▼────────┐
//!                    │ Node Handlers  │──▶ LLMClient / FileStore /
//!                    └────────────────┘    HttpClient / CodeExecutor
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod compile;
pub mod domain;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod handlers;
pub mod person;
pub mod ports;
pub mod state;
pub mod types;

// Internal utilities
pub mod observability;

pub use compile::{compile, CompilationResult, CompileIssue, CompilePhase};
pub use domain::{DomainDiagram, ExecutableDiagram, NodeType};
pub use engine::{Engine, ExecutionOutcome, ExecutionStatus};
pub use envelope::{ContentType, Envelope};
pub use events::{Event, EventBus, EventKind};
pub use types::{EngineConfig, Error, Result};
