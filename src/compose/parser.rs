//! Compose manifest parser

use super::config::ComposeConfig;
use crate::error::{Result, TandemError};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Locate the manifest: an explicit path wins, otherwise search `dir`
    pub fn locate(explicit: Option<&Path>, dir: &Path) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::find_compose_file(dir)
                .ok_or_else(|| TandemError::ManifestNotFound(dir.to_path_buf())),
        }
    }

    /// Parse compose file from path, interpolating the process environment
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TandemError::ManifestParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_str_with_env(&content, &env)
    }

    /// Parse compose file from string without interpolation
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| TandemError::ManifestParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Interpolate `${VAR}` references from `env`, then parse
    pub fn parse_str_with_env(content: &str, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let interpolated = interpolate(content, env)?;
        Self::parse_str(&interpolated)
    }

    /// Parse multiple compose files; later files override earlier ones
    pub fn parse_files(paths: &[&Path]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        result.services.extend_duplicates(overlay.services.duplicates());

        for (name, service) in overlay.services.iter() {
            let Some(existing) = result.services.get_mut(name) else {
                result.services.upsert(name, service.clone());
                continue;
            };

            let service = service.clone();
            if service.image.is_some() {
                existing.image = service.image;
            }
            if service.build.is_some() {
                existing.build = service.build;
            }
            if service.command.is_some() {
                existing.command = service.command;
            }
            if service.container_name.is_some() {
                existing.container_name = service.container_name;
            }
            if service.environment.is_some() {
                existing.environment = service.environment;
            }
            if service.ports.is_some() {
                existing.ports = service.ports;
            }
            if service.volumes.is_some() {
                existing.volumes = service.volumes;
            }
            if service.depends_on.is_some() {
                existing.depends_on = service.depends_on;
            }
            if service.restart.is_some() {
                existing.restart = service.restart;
            }
            if service.healthcheck.is_some() {
                existing.healthcheck = service.healthcheck;
            }
            if service.stop_grace_period.is_some() {
                existing.stop_grace_period = service.stop_grace_period;
            }
            if service.labels.is_some() {
                existing.labels = service.labels;
            }
            if service.credentials.is_some() {
                existing.credentials = service.credentials;
            }
        }

        for (name, volume) in overlay.volumes {
            result.volumes.insert(name, volume);
        }

        result
    }
}

/// Substitute `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$VAR`
/// from `env`; `$$` yields a literal `$`. Unset variables become empty.
pub fn interpolate(content: &str, env: &HashMap<String, String>) -> Result<String> {
    let re = Regex::new(
        r"\$(?:\$|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?)-([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
    )
    .map_err(|e| TandemError::Internal(format!("interpolation pattern: {}", e)))?;

    let result = re.replace_all(content, |caps: &Captures| {
        if caps.get(0).map(|m| m.as_str()) == Some("$$") {
            return "$".to_string();
        }
        let var = caps.get(1).or_else(|| caps.get(4)).map(|m| m.as_str()).unwrap_or_default();
        let value = env.get(var);
        match caps.get(3) {
            Some(default) => {
                let empty_is_unset = caps.get(2).is_some_and(|m| m.as_str() == ":");
                match value {
                    Some(v) if !(empty_is_unset && v.is_empty()) => v.clone(),
                    _ => default.as_str().to_string(),
                }
            }
            None => value.cloned().unwrap_or_default(),
        }
    });

    Ok(result.into_owned())
}
