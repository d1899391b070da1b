//! Error types for Tandem

use std::path::PathBuf;
use thiserror::Error;

/// Result type for Tandem operations
pub type Result<T> = std::result::Result<T, TandemError>;

/// Tandem error types
#[derive(Error, Debug)]
pub enum TandemError {
    #[error("No compose file found in {0}")]
    ManifestNotFound(PathBuf),

    #[error("Compose file parse error: {0}")]
    ManifestParse(String),

    #[error("Service '{service}': duplicate name '{name}'")]
    DuplicateName { service: String, name: String },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    MissingDependency { service: String, dependency: String },

    #[error("Service '{service}': host port {port}/{protocol} is already published by service '{owner}'")]
    PortCollision {
        service: String,
        owner: String,
        port: u16,
        protocol: String,
    },

    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Service '{service}': invalid {kind} '{value}': {reason}")]
    InvalidBinding {
        service: String,
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("Service '{service}': {message}")]
    InvalidService { service: String, message: String },

    #[error("Build recipe parse error at line {line}: {message}")]
    RecipeParse { line: usize, message: String },

    #[error("Build failed for service '{service}': {message}")]
    Build { service: String, message: String },

    #[error("Build aborted, failed services: {}", services.join(", "))]
    BuildAborted { services: Vec<String> },

    #[error("Failed to start service '{service}': {message}")]
    Spawn { service: String, message: String },

    #[error("Credential provisioning failed for service '{service}': {message}")]
    Credential { service: String, message: String },

    #[error("Service '{service}' gave up waiting for dependency '{dependency}' to become ready")]
    DependencyNotReady { service: String, dependency: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TandemError {
    /// Whether this error was detected while validating the manifest,
    /// before anything was built or started.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TandemError::ManifestNotFound(_)
                | TandemError::ManifestParse(_)
                | TandemError::DuplicateName { .. }
                | TandemError::MissingDependency { .. }
                | TandemError::PortCollision { .. }
                | TandemError::DependencyCycle { .. }
                | TandemError::InvalidBinding { .. }
                | TandemError::InvalidService { .. }
                | TandemError::InvalidConfig(_)
        )
    }
}
