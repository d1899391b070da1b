//! Tandem - a compose-style service orchestrator
//!
//! Tandem reads a compose manifest and runs the services it describes:
//!
//! - Manifest validation (unique names, known dependencies, free host ports, no cycles)
//! - Building each service's artifact before anything starts
//! - Dependency-ordered start-up, optionally gated on readiness
//! - Per-service supervision under its restart policy
//! - Environment, mount and credential injection at every start

pub mod compose;
pub mod error;
pub mod image;
pub mod inject;
pub mod runtime;
pub mod service;
pub mod settings;
pub mod supervisor;

pub use error::{Result, TandemError};
