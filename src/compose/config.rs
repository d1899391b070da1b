//! Compose manifest configuration types

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Compose manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services, in document order
    #[serde(default)]
    pub services: ServiceMap,
    /// Named volumes
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub volumes: HashMap<String, Option<VolumeConfig>>,
}

/// Order-preserving service mapping that remembers repeated keys.
///
/// A plain `HashMap` would silently keep the last of two services with the
/// same name, so the entries are kept as read and duplicates are reported
/// by the resolver.
#[derive(Debug, Clone, Default)]
pub struct ServiceMap {
    entries: Vec<(String, ServiceConfig)>,
    duplicates: Vec<String>,
}

impl ServiceMap {
    /// Add a service; a repeated name is recorded as a duplicate
    pub fn insert(&mut self, name: &str, service: ServiceConfig) {
        if self.contains_key(name) {
            self.duplicates.push(name.to_string());
        } else {
            self.entries.push((name.to_string(), service));
        }
    }

    /// Replace an existing service or append a new one
    pub fn upsert(&mut self, name: &str, service: ServiceConfig) {
        match self.get_mut(name) {
            Some(existing) => *existing = service,
            None => self.entries.push((name.to_string(), service)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceConfig> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Service names in document order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceConfig)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ServiceConfig)> {
        self.entries.iter_mut().map(|(n, s)| (n.as_str(), s))
    }

    /// Names that appeared more than once in the source document
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    /// Record `names` as duplicates found in another document
    pub fn extend_duplicates(&mut self, names: &[String]) {
        self.duplicates.extend_from_slice(names);
    }
}

impl Serialize for ServiceMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, service) in &self.entries {
            map.serialize_entry(name, service)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ServiceMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ServiceMapVisitor;

        impl<'de> Visitor<'de> for ServiceMapVisitor {
            type Value = ServiceMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of service names to service definitions")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<ServiceMap, E> {
                Ok(ServiceMap::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ServiceMap, A::Error> {
                let mut map = ServiceMap::default();
                while let Some((name, service)) =
                    access.next_entry::<String, Option<ServiceConfig>>()?
                {
                    map.insert(&name, service.unwrap_or_default());
                }
                Ok(map)
            }
        }

        deserializer.deserialize_any(ServiceMapVisitor)
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Prebuilt image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// Command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Stable container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Readiness probe settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Grace period between terminate and kill
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Credential providers
    #[serde(
        default,
        rename = "x-credentials",
        skip_serializing_if = "Option::is_none"
    )]
    pub credentials: Option<Vec<CredentialConfig>>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    #[serde(default)]
    pub context: Option<String>,
    /// Recipe path, relative to the context
    #[serde(default)]
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default)]
    pub args: Option<HashMap<String, String>>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(HashMap<String, Option<EnvValue>>),
}

/// Scalar environment value; YAML numbers and booleans are accepted as-is
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    String(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::String(s) => write!(f, "{}", s),
            EnvValue::Number(n) => write!(f, "{}", n),
            EnvValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port: `- 8080`
    Number(u16),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default)]
    pub published: Option<PublishedPort>,
    /// Host IP to bind to
    #[serde(default)]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Published port, written either as a number or a string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublishedPort {
    Number(u16),
    Text(String),
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "host:container:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (bind or volume)
    #[serde(rename = "type", default)]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default)]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default)]
    pub read_only: Option<bool>,
}

/// Named volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    #[serde(default)]
    pub driver: Option<String>,
    /// Engine-side name
    #[serde(default)]
    pub name: Option<String>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(HashMap<String, DependsOnCondition>),
}

impl DependsOnConfig {
    /// Dependency names with their conditions; array entries default to
    /// `service_started`. Map entries are sorted for a stable order.
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            DependsOnConfig::Array(arr) => arr.iter().map(|d| (d.clone(), None)).collect(),
            DependsOnConfig::Map(map) => {
                let mut entries: Vec<_> = map
                    .iter()
                    .map(|(d, c)| (d.clone(), c.condition.clone()))
                    .collect();
                entries.sort();
                entries
            }
        }
    }
}

/// Depends on condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default)]
    pub condition: Option<String>,
}

/// Readiness probe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Interval between probe attempts
    #[serde(default)]
    pub interval: Option<String>,
    /// Timeout of one attempt
    #[serde(default)]
    pub timeout: Option<String>,
    /// Attempts before giving up
    #[serde(default)]
    pub retries: Option<u32>,
    /// Delay before the first attempt
    #[serde(default)]
    pub start_period: Option<String>,
    /// Disable the probe
    #[serde(default)]
    pub disable: Option<bool>,
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(HashMap<String, String>),
}

/// Credential provider declaration (`x-credentials`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CredentialConfig {
    /// Bind a host credential directory into the service
    Mount {
        source: String,
        target: String,
        #[serde(default)]
        read_only: Option<bool>,
    },
    /// Copy a variable from the orchestrator's environment
    Env {
        name: String,
        #[serde(default)]
        from: Option<String>,
    },
    /// Fetch a secret over HTTP at every start
    Remote {
        name: String,
        url: String,
        #[serde(default)]
        headers: Option<HashMap<String, String>>,
        #[serde(default)]
        json_field: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_forms() {
        let yaml = r#"
services:
  ga4_server:
    build:
      context: ./servers/ga4_server
      dockerfile: Dockerfile.dev
      args:
        PY: "3.11"
    ports:
      - target: 8002
        published: "8002"
        protocol: tcp
      - 9000
    volumes:
      - type: bind
        source: ./servers/ga4_server
        target: /app
        read_only: true
    depends_on:
      cache:
        condition: service_healthy
      db: {}
    x-credentials:
      - type: remote
        name: ACCESS_TOKEN
        url: http://metadata.local/token
        json_field: access_token
  cache:
    image: redis:7
  db:
"#;
        let config: ComposeConfig = serde_yaml::from_str(yaml).unwrap();
        let server = config.services.get("ga4_server").unwrap();

        assert!(matches!(
            &server.build,
            Some(BuildConfig::Full(full)) if full.dockerfile.as_deref() == Some("Dockerfile.dev")
        ));
        let ports = server.ports.as_ref().unwrap();
        assert!(matches!(&ports[0], PortConfig::Long(long) if long.target == 8002));
        assert!(matches!(ports[1], PortConfig::Number(9000)));
        assert!(matches!(
            &server.volumes.as_ref().unwrap()[0],
            VolumeMount::Long(long) if long.read_only == Some(true)
        ));
        assert_eq!(
            server.depends_on.as_ref().unwrap().entries(),
            vec![
                ("cache".to_string(), Some("service_healthy".to_string())),
                ("db".to_string(), None),
            ]
        );
        assert!(matches!(
            &server.credentials.as_ref().unwrap()[0],
            CredentialConfig::Remote { name, .. } if name == "ACCESS_TOKEN"
        ));

        // A service written as a bare key is an empty definition
        assert!(config.services.get("db").unwrap().image.is_none());
    }

    #[test]
    fn test_service_map_keeps_document_order() {
        let config: ComposeConfig =
            serde_yaml::from_str("services:\n  zeta: {image: z}\n  alpha: {image: a}\n").unwrap();
        let names: Vec<&str> = config.services.names().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);

        let rendered = serde_yaml::to_string(&config).unwrap();
        assert!(rendered.find("zeta").unwrap() < rendered.find("alpha").unwrap());
    }

    #[test]
    fn test_environment_values() {
        let config: ComposeConfig = serde_yaml::from_str(
            "services:\n  a:\n    image: x\n    environment:\n      PORT: 8002\n      DEBUG: false\n      NAME: demo\n",
        )
        .unwrap();
        let Some(EnvironmentConfig::Map(env)) = &config.services.get("a").unwrap().environment else {
            panic!("expected map form");
        };
        let value = |k: &str| env[k].as_ref().unwrap().to_string();
        assert_eq!(value("PORT"), "8002");
        assert_eq!(value("DEBUG"), "false");
        assert_eq!(value("NAME"), "demo");
    }
}
