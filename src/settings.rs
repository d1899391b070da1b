//! Orchestrator settings

use crate::error::{Result, TandemError};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides the project name
pub const PROJECT_NAME_ENV: &str = "TANDEM_PROJECT_NAME";

/// Default time a process gets between the terminate request and the kill
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one orchestrator invocation
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory mount sources and build contexts are resolved against
    pub working_dir: PathBuf,
    /// Explicit project name (CLI flag or environment)
    pub project_name: Option<String>,
    /// Pause between a process exit and its relaunch
    pub restart_delay: Duration,
    /// Grace period for services that do not declare `stop_grace_period`
    pub stop_timeout: Duration,
    /// Container engine CLI used by the docker runtime
    pub docker_bin: String,
}

impl Settings {
    /// Create settings rooted at a working directory
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            project_name: std::env::var(PROJECT_NAME_ENV).ok().filter(|s| !s.is_empty()),
            restart_delay: Duration::ZERO,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            docker_bin: "docker".to_string(),
        }
    }

    /// Set project name
    pub fn project_name(mut self, name: &str) -> Self {
        self.project_name = Some(name.to_string());
        self
    }

    /// Set restart delay
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Set stop timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Project name: explicit setting, then the manifest's `name`, then the
    /// working directory's base name.
    pub fn resolve_project_name(&self, manifest_name: Option<&str>) -> String {
        let raw = self
            .project_name
            .clone()
            .or_else(|| manifest_name.map(str::to_string))
            .unwrap_or_else(|| {
                self.working_dir
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("default")
                    .to_string()
            });
        normalize_project_name(&raw)
    }
}

/// Lowercase and strip characters the container engine rejects in names
pub fn normalize_project_name(raw: &str) -> String {
    let name: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if name.is_empty() {
        "default".to_string()
    } else {
        name
    }
}

/// Parse a compose-style duration such as `10s`, `1m30s`, `500ms` or `1h`.
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(TandemError::InvalidConfig("empty duration".to_string()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| TandemError::InvalidConfig(format!("missing unit in duration '{}'", input)))?;
        if digits == 0 {
            return Err(TandemError::InvalidConfig(format!("invalid duration '{}'", input)));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| TandemError::InvalidConfig(format!("invalid duration '{}'", input)))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = match unit {
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => {
                return Err(TandemError::InvalidConfig(format!(
                    "unknown unit '{}' in duration '{}'",
                    unit, input
                )))
            }
        };
        let part = Duration::try_from_secs_f64(value * scale)
            .map_err(|_| TandemError::InvalidConfig(format!("duration '{}' is out of range", input)))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| TandemError::InvalidConfig(format!("duration '{}' is out of range", input)))?;
    }
    Ok(total)
}
