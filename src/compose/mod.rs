//! Compose-style manifests
//!
//! Parsing, validation and dependency ordering of a multi-service manifest,
//! plus the [`Stack`] that runs one.

pub mod config;
pub mod graph;
pub mod orchestrator;
pub mod parser;
pub mod resolver;

pub use config::{ComposeConfig, ServiceConfig};
pub use graph::DependencyGraph;
pub use orchestrator::{ProjectState, Stack};
pub use parser::ComposeParser;
pub use resolver::{LaunchPlan, ServiceResolver};
