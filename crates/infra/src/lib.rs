//! # Cloudbridge Infrastructure
//!
//! Adapters that touch the outside world.
//!
//! This crate contains:
//! - Configuration loading (JSON/TOML files plus `CLOUDBRIDGE_*` overrides)
//! - File-backed session persistence implementing `SessionStore`
//! - Tracing subscriber initialisation
//!
//! ## Architecture Principles
//! - Implements ports defined in `cloudbridge-core`
//! - Holds all filesystem and process-environment access

pub mod config;
pub mod observability;
pub mod session;

pub use observability::{init_tracing, init_tracing_with, LoggingError};
pub use session::{FileSessionStore, PersistedSession};
