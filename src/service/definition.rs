//! Service definitions

use super::binding::{EnvBinding, MountBinding, PortBinding};
use super::restart::RestartPolicy;
use crate::compose::config::CredentialConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where a service's runnable artifact comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Build from a context directory
    Build {
        context: PathBuf,
        recipe: PathBuf,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        args: BTreeMap<String, String>,
    },
    /// Use a prebuilt image
    Image(String),
}

/// When a dependent may start relative to its dependency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The dependency's start command has been issued
    #[default]
    ServiceStarted,
    /// The dependency's readiness probe succeeded
    ServiceHealthy,
}

impl DependencyCondition {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "service_started" => Some(DependencyCondition::ServiceStarted),
            "service_healthy" => Some(DependencyCondition::ServiceHealthy),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyCondition::ServiceStarted => write!(f, "service_started"),
            DependencyCondition::ServiceHealthy => write!(f, "service_healthy"),
        }
    }
}

/// Start-order edge from the owning service to `dependency`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub dependency: String,
    #[serde(default)]
    pub condition: DependencyCondition,
}

impl DependencyEdge {
    pub fn started(dependency: &str) -> Self {
        Self {
            dependency: dependency.to_string(),
            condition: DependencyCondition::ServiceStarted,
        }
    }
}

/// TCP readiness probe timings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessProbe {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(with = "duration_ms")]
    pub start_period: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            retries: 30,
            start_period: Duration::ZERO,
        }
    }
}

/// Validated, immutable description of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Key in the manifest's `services` mapping
    pub name: String,
    /// Stable process identifier
    pub container_name: String,
    pub source: ArtifactSource,
    pub restart: RestartPolicy,
    #[serde(default)]
    pub environment: Vec<EnvBinding>,
    #[serde(default)]
    pub mounts: Vec<MountBinding>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    /// Launch command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Vec<DependencyEdge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<ReadinessProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub stop_grace_period: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ServiceDefinition {
    /// Minimal definition for a prebuilt image
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            container_name: name.to_string(),
            source: ArtifactSource::Image(image.to_string()),
            restart: RestartPolicy::No,
            environment: Vec::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            command: None,
            depends_on: Vec::new(),
            credentials: Vec::new(),
            healthcheck: None,
            stop_grace_period: None,
            labels: BTreeMap::new(),
        }
    }

    /// Set restart policy
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Add a port binding
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortBinding::new(host_port, container_port));
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.push(EnvBinding::new(key, value));
        self
    }

    /// Add a start-order dependency
    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.depends_on.push(DependencyEdge::started(dependency));
        self
    }

    /// First host port this service publishes, used for readiness probing
    pub fn probe_port(&self) -> Option<u16> {
        self.ports.iter().find_map(|p| p.host_port)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
