//! # Cloudbridge Domain
//!
//! Domain types for the cloud device bridge governance layer.
//!
//! This crate contains:
//! - Device, command and session types
//! - The `CallOutcome` sum type that keeps "denied" and "empty" apart
//! - Domain error types and Result definitions
//! - Configuration structures with defaults and validation
//!
//! ## Architecture
//! - No dependencies on other Cloudbridge crates
//! - Only external dependencies allowed
//! - Pure domain models and data structures

pub mod config;
pub mod constants;
pub mod errors;
pub mod macros;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
