//! Service definition resolver
//!
//! Turns a parsed manifest into a [`LaunchPlan`]: every service converted to
//! a [`ServiceDefinition`], every invariant checked, services ordered so that
//! dependencies come first. Nothing here touches the filesystem or starts
//! anything.

use super::config::{
    BuildConfig, CommandConfig, ComposeConfig, EnvironmentConfig, LabelsConfig, ServiceConfig,
};
use super::graph::DependencyGraph;
use crate::error::{Result, TandemError};
use crate::image::DEFAULT_RECIPE_FILE;
use crate::service::binding::normalize;
use crate::service::{
    ArtifactSource, DependencyCondition, DependencyEdge, EnvBinding, MountBinding, MountSource,
    PortBinding, ReadinessProbe, RestartPolicy, ServiceDefinition,
};
use crate::settings::parse_duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Validated, ordered set of services for one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchPlan {
    /// Project name
    pub project: String,
    /// Network every service joins
    pub network: String,
    /// Services in start order
    pub services: Vec<ServiceDefinition>,
    /// Non-fatal findings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl LaunchPlan {
    /// Service names in start order
    pub fn order(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }

    /// Service names in stop order (dependents before their dependencies)
    pub fn shutdown_order(&self) -> Vec<&str> {
        self.services.iter().rev().map(|s| s.name.as_str()).collect()
    }

    /// Look up a service
    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a service or fail
    pub fn service(&self, name: &str) -> Result<&ServiceDefinition> {
        self.get(name)
            .ok_or_else(|| TandemError::ServiceNotFound(name.to_string()))
    }
}

/// Validates definitions and computes the launch order
pub struct ServiceResolver<'a> {
    project: String,
    working_dir: &'a Path,
    host_env: HashMap<String, String>,
}

impl<'a> ServiceResolver<'a> {
    /// Create a resolver; bare `KEY` environment entries read from the
    /// orchestrator's own environment.
    pub fn new(project: &str, working_dir: &'a Path) -> Self {
        Self {
            project: project.to_string(),
            working_dir,
            host_env: std::env::vars().collect(),
        }
    }

    /// Replace the environment bare `KEY` entries are read from
    pub fn with_host_env(mut self, env: HashMap<String, String>) -> Self {
        self.host_env = env;
        self
    }

    /// Resolve a parsed manifest
    pub fn resolve(&self, config: &ComposeConfig) -> Result<LaunchPlan> {
        if let Some(name) = config.services.duplicates().first() {
            return Err(TandemError::DuplicateName {
                service: name.clone(),
                name: name.clone(),
            });
        }
        if config.services.is_empty() {
            return Err(TandemError::InvalidConfig("no services defined".to_string()));
        }

        let mut warnings = Vec::new();
        let mut definitions = Vec::with_capacity(config.services.len());
        for (name, service) in config.services.iter() {
            definitions.push(self.definition(name, service, &mut warnings)?);
        }

        for def in &definitions {
            for mount in &def.mounts {
                if let MountSource::Named(volume) = &mount.source {
                    if !config.volumes.contains_key(volume) {
                        warnings.push(format!(
                            "Service '{}' references undefined volume '{}' (will be created)",
                            def.name, volume
                        ));
                    }
                }
            }
        }

        self.plan(definitions, warnings)
    }

    /// Validate definitions built in code and order them
    pub fn plan(
        &self,
        definitions: Vec<ServiceDefinition>,
        warnings: Vec<String>,
    ) -> Result<LaunchPlan> {
        check_unique_names(&definitions)?;
        check_port_collisions(&definitions)?;

        let mut graph = DependencyGraph::new();
        for def in &definitions {
            graph.add_service(&def.name);
        }
        for def in &definitions {
            for edge in &def.depends_on {
                graph.add_dependency(&def.name, &edge.dependency)?;
            }
        }
        check_readiness_edges(&definitions)?;

        let order = graph.start_order()?;
        let mut by_name: HashMap<String, ServiceDefinition> = definitions
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let services = order
            .iter()
            .filter_map(|name| by_name.remove(name))
            .collect();

        Ok(LaunchPlan {
            project: self.project.clone(),
            network: format!("{}_default", self.project),
            services,
            warnings,
        })
    }

    /// Convert one manifest entry
    fn definition(
        &self,
        name: &str,
        service: &ServiceConfig,
        warnings: &mut Vec<String>,
    ) -> Result<ServiceDefinition> {
        let invalid = |message: String| TandemError::InvalidService {
            service: name.to_string(),
            message,
        };

        let source = match (&service.build, &service.image) {
            (Some(build), _) => self.build_source(build),
            (None, Some(image)) => ArtifactSource::Image(image.clone()),
            (None, None) => {
                return Err(invalid(
                    "must have either 'image' or 'build' specified".to_string(),
                ))
            }
        };

        let restart = match &service.restart {
            Some(policy) => policy.parse::<RestartPolicy>().map_err(invalid)?,
            None => RestartPolicy::No,
        };

        let environment = match &service.environment {
            Some(env) => self.environment(name, env, warnings)?,
            None => Vec::new(),
        };

        let mounts = service
            .volumes
            .iter()
            .flatten()
            .map(|v| MountBinding::from_config(name, v, self.working_dir))
            .collect::<Result<Vec<_>>>()?;

        let ports = service
            .ports
            .iter()
            .flatten()
            .map(|p| PortBinding::from_config(name, p))
            .collect::<Result<Vec<_>>>()?;

        let command = service.command.as_ref().map(|cmd| match cmd {
            CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            CommandConfig::Exec(arr) => arr.clone(),
        });

        let mut depends_on = Vec::new();
        for (dependency, condition) in service.depends_on.iter().flat_map(|d| d.entries()) {
            let condition = match condition.as_deref() {
                None => DependencyCondition::ServiceStarted,
                Some(c) => DependencyCondition::parse(c).ok_or_else(|| {
                    invalid(format!(
                        "unsupported condition '{}' for dependency '{}'",
                        c, dependency
                    ))
                })?,
            };
            depends_on.push(DependencyEdge {
                dependency,
                condition,
            });
        }

        let healthcheck = match &service.healthcheck {
            Some(hc) if hc.disable != Some(true) => {
                let defaults = ReadinessProbe::default();
                let duration = |value: &Option<String>, fallback| match value {
                    Some(v) => parse_duration(v).map_err(|e| invalid(e.to_string())),
                    None => Ok(fallback),
                };
                Some(ReadinessProbe {
                    interval: duration(&hc.interval, defaults.interval)?,
                    timeout: duration(&hc.timeout, defaults.timeout)?,
                    retries: hc.retries.unwrap_or(defaults.retries),
                    start_period: duration(&hc.start_period, defaults.start_period)?,
                })
            }
            _ => None,
        };

        let stop_grace_period = service
            .stop_grace_period
            .as_deref()
            .map(|v| parse_duration(v).map_err(|e| invalid(e.to_string())))
            .transpose()?;

        let labels = match &service.labels {
            Some(LabelsConfig::Map(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(LabelsConfig::Array(arr)) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
            None => BTreeMap::new(),
        };

        Ok(ServiceDefinition {
            name: name.to_string(),
            container_name: service
                .container_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-1", self.project, name)),
            source,
            restart,
            environment,
            mounts,
            ports,
            command,
            depends_on,
            credentials: service.credentials.clone().unwrap_or_default(),
            healthcheck,
            stop_grace_period,
            labels,
        })
    }

    fn build_source(&self, build: &BuildConfig) -> ArtifactSource {
        let (context, recipe, args) = match build {
            BuildConfig::Simple(path) => (path.as_str(), None, BTreeMap::new()),
            BuildConfig::Full(full) => (
                full.context.as_deref().unwrap_or("."),
                full.dockerfile.as_deref(),
                full.args
                    .iter()
                    .flatten()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        };

        let context = resolve_path(self.working_dir, context);
        let recipe = context.join(recipe.unwrap_or(DEFAULT_RECIPE_FILE));
        ArtifactSource::Build {
            context,
            recipe,
            args,
        }
    }

    fn environment(
        &self,
        service: &str,
        env: &EnvironmentConfig,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<EnvBinding>> {
        let mut pairs: Vec<(String, Option<String>)> = match env {
            EnvironmentConfig::Array(arr) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (item.clone(), None),
                })
                .collect(),
            EnvironmentConfig::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(|v| v.to_string())))
                .collect(),
        };
        if matches!(env, EnvironmentConfig::Map(_)) {
            pairs.sort();
        }

        let mut bindings: Vec<EnvBinding> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(TandemError::InvalidBinding {
                    service: service.to_string(),
                    kind: "environment variable",
                    value: key,
                    reason: "variable names must be non-empty and contain no whitespace"
                        .to_string(),
                });
            }
            let value = match value.or_else(|| self.host_env.get(&key).cloned()) {
                Some(v) => v,
                None => {
                    warnings.push(format!(
                        "Service '{}': variable '{}' is not set in the orchestrator environment, skipping",
                        service, key
                    ));
                    continue;
                }
            };
            match bindings.iter_mut().find(|b| b.key == key) {
                Some(existing) => existing.value = value,
                None => bindings.push(EnvBinding { key, value }),
            }
        }
        Ok(bindings)
    }
}

/// Join a relative path onto the working directory, expanding `~`
fn resolve_path(working_dir: &Path, path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    normalize(&working_dir.join(path))
}

fn check_unique_names(definitions: &[ServiceDefinition]) -> Result<()> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut containers: HashMap<&str, &str> = HashMap::new();

    for def in definitions {
        if names.insert(&def.name, &def.name).is_some() {
            return Err(TandemError::DuplicateName {
                service: def.name.clone(),
                name: def.name.clone(),
            });
        }
        if let Some(owner) = containers.insert(&def.container_name, &def.name) {
            return Err(TandemError::DuplicateName {
                service: def.name.clone(),
                name: format!("{} (container name also used by '{}')", def.container_name, owner),
            });
        }
    }
    Ok(())
}

fn check_port_collisions(definitions: &[ServiceDefinition]) -> Result<()> {
    let mut claimed: Vec<(&str, &PortBinding)> = Vec::new();

    for def in definitions {
        for port in &def.ports {
            if let Some((owner, _)) = claimed.iter().find(|(_, p)| p.collides_with(port)) {
                return Err(TandemError::PortCollision {
                    service: def.name.clone(),
                    owner: owner.to_string(),
                    port: port.host_port.unwrap_or_default(),
                    protocol: port.protocol.to_string(),
                });
            }
            claimed.push((def.name.as_str(), port));
        }
    }
    Ok(())
}

fn check_readiness_edges(definitions: &[ServiceDefinition]) -> Result<()> {
    for def in definitions {
        for edge in &def.depends_on {
            if edge.condition != DependencyCondition::ServiceHealthy {
                continue;
            }
            let probed = definitions
                .iter()
                .find(|d| d.name == edge.dependency)
                .and_then(ServiceDefinition::probe_port);
            if probed.is_none() {
                return Err(TandemError::InvalidService {
                    service: def.name.clone(),
                    message: format!(
                        "condition service_healthy needs dependency '{}' to publish a host port",
                        edge.dependency
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::ComposeParser;

    const STACK: &str = r#"
services:
  ga4_server:
    build: ./servers/ga4_server
    container_name: ga4_server
    restart: always
    environment:
      - GOOGLE_CLOUD_PROJECT=analytics-demo
    volumes:
      - ./servers/ga4_server:/app
    ports:
      - "8002:8002"
  hostclient:
    build: ./client
    container_name: hostclient
    restart: always
    volumes:
      - ./client:/app
    ports:
      - "8501:8501"
    command: streamlit run app.py
    depends_on:
      - ga4_server
"#;

    fn resolve(yaml: &str) -> Result<LaunchPlan> {
        let config = ComposeParser::parse_str(yaml)?;
        ServiceResolver::new("demo", Path::new("/srv/demo"))
            .with_host_env(HashMap::new())
            .resolve(&config)
    }

    #[test]
    fn test_resolve_two_service_stack() {
        let plan = resolve(STACK).unwrap();
        assert_eq!(plan.order(), vec!["ga4_server", "hostclient"]);
        assert_eq!(plan.shutdown_order(), vec!["hostclient", "ga4_server"]);
        assert_eq!(plan.network, "demo_default");

        let server = plan.service("ga4_server").unwrap();
        assert_eq!(server.restart, RestartPolicy::Always);
        assert_eq!(server.environment, vec![EnvBinding::new("GOOGLE_CLOUD_PROJECT", "analytics-demo")]);
        assert_eq!(server.ports, vec![PortBinding::new(8002, 8002)]);
        assert_eq!(
            server.source,
            ArtifactSource::Build {
                context: PathBuf::from("/srv/demo/servers/ga4_server"),
                recipe: PathBuf::from("/srv/demo/servers/ga4_server/Dockerfile"),
                args: BTreeMap::new(),
            }
        );

        let client = plan.service("hostclient").unwrap();
        assert_eq!(client.command.as_ref().unwrap()[2], "streamlit run app.py");
        assert_eq!(client.depends_on, vec![DependencyEdge::started("ga4_server")]);
        assert!(client.environment.is_empty());
    }

    #[test]
    fn test_dependency_declared_after_dependent() {
        let plan = resolve(
            r#"
services:
  web:
    image: nginx
    depends_on: [api]
  api:
    image: node
"#,
        )
        .unwrap();
        assert_eq!(plan.order(), vec!["api", "web"]);
        assert_eq!(plan.service("web").unwrap().container_name, "demo-web-1");
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let err = resolve(
            r#"
services:
  hostclient:
    image: client
    depends_on: [ga4_server]
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TandemError::MissingDependency { ref service, ref dependency }
                if service == "hostclient" && dependency == "ga4_server"
        ));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let err = resolve(
            r#"
services:
  api:
    image: a
  api:
    image: b
"#,
        )
        .unwrap_err();
        assert!(matches!(err, TandemError::DuplicateName { ref service, .. } if service == "api"));
    }

    #[test]
    fn test_duplicate_container_name_rejected() {
        let err = resolve(
            r#"
services:
  a:
    image: x
    container_name: shared
  b:
    image: y
    container_name: shared
"#,
        )
        .unwrap_err();
        assert!(matches!(err, TandemError::DuplicateName { ref service, .. } if service == "b"));
    }

    #[test]
    fn test_port_collision_rejected() {
        let err = resolve(
            r#"
services:
  a:
    image: x
    ports: ["8002:8002"]
  b:
    image: y
    ports: ["8002:9000"]
"#,
        )
        .unwrap_err();
        match err {
            TandemError::PortCollision { service, owner, port, .. } => {
                assert_eq!(service, "b");
                assert_eq!(owner, "a");
                assert_eq!(port, 8002);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let err = resolve(
            r#"
services:
  a:
    image: x
    depends_on: [b]
  b:
    image: y
    depends_on: [a]
"#,
        )
        .unwrap_err();
        match err {
            TandemError::DependencyCycle { cycle } => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_image_and_build_rejected() {
        let err = resolve("services:\n  web:\n    ports: [\"80:80\"]\n").unwrap_err();
        assert!(matches!(err, TandemError::InvalidService { .. }));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_environment_forms() {
        let config = ComposeParser::parse_str(
            r#"
services:
  api:
    image: x
    environment:
      PORT: 8002
      DEBUG: true
      TOKEN:
"#,
        )
        .unwrap();
        let mut host = HashMap::new();
        host.insert("TOKEN".to_string(), "from-host".to_string());
        let plan = ServiceResolver::new("demo", Path::new("/srv"))
            .with_host_env(host)
            .resolve(&config)
            .unwrap();
        let env = &plan.service("api").unwrap().environment;
        assert_eq!(
            env,
            &vec![
                EnvBinding::new("DEBUG", "true"),
                EnvBinding::new("PORT", "8002"),
                EnvBinding::new("TOKEN", "from-host"),
            ]
        );
    }

    #[test]
    fn test_unset_passthrough_variable_is_skipped_with_warning() {
        let plan = resolve(
            r#"
services:
  api:
    image: x
    environment: [GOOGLE_APPLICATION_CREDENTIALS]
"#,
        )
        .unwrap();
        assert!(plan.service("api").unwrap().environment.is_empty());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_healthy_condition_requires_published_port() {
        let err = resolve(
            r#"
services:
  api:
    image: x
  web:
    image: y
    depends_on:
      api:
        condition: service_healthy
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("publish a host port"));

        let plan = resolve(
            r#"
services:
  api:
    image: x
    ports: ["8002:8002"]
    healthcheck:
      interval: 2s
      retries: 5
  web:
    image: y
    depends_on:
      api:
        condition: service_healthy
"#,
        )
        .unwrap();
        let web = plan.service("web").unwrap();
        assert_eq!(web.depends_on[0].condition, DependencyCondition::ServiceHealthy);
        let probe = plan.service("api").unwrap().healthcheck.unwrap();
        assert_eq!(probe.interval, std::time::Duration::from_secs(2));
        assert_eq!(probe.retries, 5);
    }

    #[test]
    fn test_unknown_restart_policy_rejected() {
        let err = resolve("services:\n  a:\n    image: x\n    restart: sometimes\n").unwrap_err();
        assert!(err.to_string().contains("unknown restart policy"));
    }

    #[test]
    fn test_plan_from_code() {
        let defs = vec![
            ServiceDefinition::new("serviceB", "b").port(8501, 8501).depends_on("serviceA"),
            ServiceDefinition::new("serviceA", "a").port(8002, 8002),
        ];
        let plan = ServiceResolver::new("t", Path::new("/"))
            .plan(defs, Vec::new())
            .unwrap();
        assert_eq!(plan.order(), vec!["serviceA", "serviceB"]);

        let dup = vec![
            ServiceDefinition::new("a", "x"),
            ServiceDefinition::new("a", "y"),
        ];
        assert!(matches!(
            ServiceResolver::new("t", Path::new("/")).plan(dup, Vec::new()),
            Err(TandemError::DuplicateName { .. })
        ));
    }
}
