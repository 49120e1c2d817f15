//! # Atelier
//!
//! Atelier is a local, multi-task coding-agent orchestrator: it runs many
//! long-lived agent sessions in parallel, each inside an isolated environment,
//! keeps the user's on-disk git repository in sync with each agent's
//! in-container repository, surfaces a live event stream of agent activity to
//! UI clients, and persists every interaction durably so any session can be
//! resumed after a crash.
//!
//! ## Architecture
//!
//! The system consists of:
//! - **Task scheduler**: owns the lifecycle of agent tasks and restarts them
//!   idempotently after a server restart
//! - **Persistent store**: dual-table snapshot model with a change broadcast
//! - **Task message bus**: per-task fanout of agent/user messages
//! - **Agent runner**: drives one agent process inside one environment
//! - **Local-sync engine**: debounced two-axis reconciliation between the
//!   user's working copy and the agent's in-container copy
//! - **Environment abstraction**: container lifecycle, process execution,
//!   snapshots, and image cleanup
//! - **Streaming façade**: converts internal events into typed UI updates
//!
//! ## Usage
//!
//! The system is typically run as a standalone local server that a UI client
//! connects to over the typed event-stream endpoints.

/// HTTP API server and event-stream endpoints
pub mod api;
/// Authentication and authorization
pub mod auth;
/// Per-task message bus
pub mod bus;
/// Strand accounting for spawned tasks and processes
pub mod concurrency;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Diff tracking for tool-driven file edits
pub mod diff;
/// Environment abstraction and providers
pub mod env;
/// Error types and handling
pub mod error;
/// Git repository service
pub mod git;
/// Typed identifiers
pub mod ids;
/// Structured logging setup
pub mod logs;
/// Message sum type and content blocks
pub mod messages;
/// Core data models
pub mod models;
/// Agent runner
pub mod runner;
/// Task scheduler
pub mod scheduler;
/// Persistent store
pub mod store;
/// Local-sync engine
pub mod sync;

pub use error::{AtelierError, Result};
