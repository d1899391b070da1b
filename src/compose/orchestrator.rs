//! Compose stack orchestrator
//!
//! Drives one project through build, dependency-ordered launch, supervision
//! and teardown.

use super::parser::ComposeParser;
use super::resolver::{LaunchPlan, ServiceResolver};
use crate::error::{Result, TandemError};
use crate::image::{Artifact, BuildStage};
use crate::inject::Injector;
use crate::runtime::ContainerRuntime;
use crate::service::DependencyCondition;
use crate::settings::Settings;
use crate::supervisor::{wait_ready, ServiceStatus, Supervisor, SupervisorEvent};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Compose project state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    /// Project is not running
    Stopped,
    /// Project is building and starting
    Starting,
    /// Every service has been issued its start command
    Running,
    /// Project is stopping
    Stopping,
    /// Build or launch failed
    Error,
}

/// One orchestrated project
pub struct Stack {
    plan: LaunchPlan,
    settings: Settings,
    runtime: Arc<dyn ContainerRuntime>,
    supervisor: Option<Supervisor>,
    state: ProjectState,
    session: Uuid,
}

impl Stack {
    /// Locate, parse and resolve the manifest. Later files in `manifests`
    /// are merged over earlier ones; with none given the working directory
    /// is searched. Relative paths resolve against the first manifest's
    /// directory.
    pub fn load(
        mut settings: Settings,
        manifests: &[PathBuf],
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let paths = if manifests.is_empty() {
            vec![ComposeParser::locate(None, &settings.working_dir)?]
        } else {
            manifests.to_vec()
        };
        let paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|path| {
                if path.is_absolute() {
                    path
                } else {
                    settings.working_dir.join(path)
                }
            })
            .collect();
        if let Some(missing) = paths.iter().find(|path| !path.is_file()) {
            return Err(TandemError::ManifestNotFound(missing.clone()));
        }
        if let Some(dir) = paths.first().and_then(|path| path.parent()) {
            settings.working_dir = dir.to_path_buf();
        }

        for path in &paths {
            tracing::debug!("Loading {}", path.display());
        }
        let refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        let config = ComposeParser::parse_files(&refs)?;
        let project = settings.resolve_project_name(config.name.as_deref());
        let plan = ServiceResolver::new(&project, &settings.working_dir).resolve(&config)?;
        for warning in &plan.warnings {
            tracing::warn!("{}", warning);
        }

        Ok(Self::new(plan, settings, runtime))
    }

    /// Create a stack from an already resolved plan
    pub fn new(plan: LaunchPlan, settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            plan,
            settings,
            runtime,
            supervisor: None,
            state: ProjectState::Stopped,
            session: Uuid::new_v4(),
        }
    }

    /// The validated launch plan
    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    /// Current project state
    pub fn state(&self) -> ProjectState {
        self.state
    }

    /// Build artifacts for the named services (all when empty)
    pub async fn build(&self, only: &[String]) -> Result<BTreeMap<String, Artifact>> {
        BuildStage::new(Arc::clone(&self.runtime), &self.plan.project)
            .build_all(&self.plan, only)
            .await
    }

    /// Build everything, then start services in dependency order. Returns
    /// once every service has been issued its first start command.
    pub async fn up(&mut self, build: bool) -> Result<()> {
        if self.supervisor.is_some() {
            return Err(TandemError::Internal(format!(
                "project {} is already up",
                self.plan.project
            )));
        }

        self.state = ProjectState::Starting;
        tracing::info!(
            "Starting project {} with {} services via {} (session {})",
            self.plan.project,
            self.plan.services.len(),
            self.runtime.name(),
            self.session
        );

        match self.launch(build).await {
            Ok(supervisor) => {
                self.supervisor = Some(supervisor);
                self.state = ProjectState::Running;
                tracing::info!("Project {} is up", self.plan.project);
                Ok(())
            }
            Err(e) => {
                self.state = ProjectState::Error;
                Err(e)
            }
        }
    }

    async fn launch(&self, build: bool) -> Result<Supervisor> {
        let stage = BuildStage::new(Arc::clone(&self.runtime), &self.plan.project);
        let artifacts = if build {
            stage.build_all(&self.plan, &[]).await?
        } else {
            stage.existing(&self.plan)
        };

        self.runtime.prepare(&self.plan.network).await?;

        let injector = Injector::new(&self.plan, &self.settings.working_dir)?;
        let mut supervisor = Supervisor::new(
            Arc::clone(&self.runtime),
            Arc::new(injector),
            &self.settings,
        );

        for def in &self.plan.services {
            for edge in &def.depends_on {
                if edge.condition != DependencyCondition::ServiceHealthy {
                    continue;
                }
                let dependency = self.plan.service(&edge.dependency)?;
                if let Err(e) = wait_ready(&def.name, dependency).await {
                    tracing::error!("{}", e);
                    if let Err(stop_err) = supervisor.stop_all(&self.plan.shutdown_order()).await {
                        tracing::warn!("Cleanup after failed launch: {}", stop_err);
                    }
                    if let Err(net_err) = self.runtime.teardown(&self.plan.network).await {
                        tracing::warn!("Cleanup after failed launch: {}", net_err);
                    }
                    return Err(e);
                }
            }

            let artifact = artifacts.get(&def.name).cloned().ok_or_else(|| {
                TandemError::Internal(format!("no artifact for service {}", def.name))
            })?;
            tracing::info!("Starting service {}", def.name);
            supervisor.launch(def.clone(), artifact).await?;
        }

        Ok(supervisor)
    }

    /// Stop every service, dependents before their dependencies, and remove
    /// the project network. Without a running supervisor this removes
    /// leftover processes by name.
    pub async fn down(&mut self) -> Result<()> {
        self.state = ProjectState::Stopping;
        tracing::info!("Stopping project {}", self.plan.project);

        match self.supervisor.take() {
            Some(mut supervisor) => {
                supervisor.stop_all(&self.plan.shutdown_order()).await?;
            }
            None => {
                for def in self.plan.services.iter().rev() {
                    self.runtime.remove(&def.container_name).await?;
                }
            }
        }

        self.runtime.teardown(&self.plan.network).await?;
        self.state = ProjectState::Stopped;
        Ok(())
    }

    /// Status of every supervised service
    pub fn status(&self) -> Result<Vec<ServiceStatus>> {
        match &self.supervisor {
            Some(supervisor) => supervisor.status(),
            None => Ok(Vec::new()),
        }
    }

    /// Subscribe to supervisor events; `None` before `up`
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SupervisorEvent>> {
        self.supervisor.as_ref().map(Supervisor::subscribe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryRuntime;
    use crate::service::{DependencyEdge, PortBinding, RestartPolicy, ServiceDefinition};
    use crate::supervisor::ProcessState;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    fn two_service_stack(runtime: &MemoryRuntime) -> Stack {
        let defs = vec![
            ServiceDefinition::new("serviceA", "a:latest")
                .restart(RestartPolicy::Always)
                .port(8002, 8002),
            ServiceDefinition::new("serviceB", "b:latest")
                .restart(RestartPolicy::Always)
                .port(8501, 8501)
                .depends_on("serviceA"),
        ];
        let plan = ServiceResolver::new("demo", Path::new("/"))
            .plan(defs, Vec::new())
            .unwrap();
        Stack::new(
            plan,
            Settings::new(PathBuf::from("/")),
            Arc::new(runtime.clone()),
        )
    }

    #[tokio::test]
    async fn test_dependency_started_first() {
        let runtime = MemoryRuntime::new();
        let mut stack = two_service_stack(&runtime);
        stack.up(true).await.unwrap();
        assert_eq!(stack.state(), ProjectState::Running);

        assert_eq!(runtime.launch_order(), vec!["serviceA", "serviceB"]);
        let launches = runtime.launches();
        assert_eq!(launches[0].spec.ports, vec![PortBinding::new(8002, 8002)]);
        assert_eq!(launches[1].spec.ports, vec![PortBinding::new(8501, 8501)]);
        assert_eq!(runtime.networks(), vec!["demo_default".to_string()]);

        stack.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_crashing_dependent_leaves_dependency_alone() {
        let runtime = MemoryRuntime::new();
        let mut stack = two_service_stack(&runtime);
        stack.up(true).await.unwrap();

        for n in 1..=4 {
            assert!(runtime.wait_for_launches("serviceB", n, WAIT).await);
            assert!(runtime.crash("serviceB", 1));
        }
        assert!(runtime.wait_for_launches("serviceB", 5, WAIT).await);

        assert_eq!(runtime.launch_count("serviceA"), 1);
        assert!(runtime.is_running("serviceA"));

        let restarts: Vec<(String, u32)> = stack
            .status()
            .unwrap()
            .into_iter()
            .map(|s| (s.service, s.restarts))
            .collect();
        assert_eq!(restarts[0], ("serviceA".to_string(), 0));
        assert_eq!(restarts[1].0, "serviceB");

        stack.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_down_stops_dependents_first() {
        let runtime = MemoryRuntime::new();
        let mut stack = two_service_stack(&runtime);
        stack.up(true).await.unwrap();
        let mut events = stack.subscribe().unwrap();

        stack.down().await.unwrap();
        assert_eq!(stack.state(), ProjectState::Stopped);
        assert_eq!(runtime.terminated(), vec!["serviceB", "serviceA"]);
        assert!(runtime.networks().is_empty());
        assert!(!runtime.is_running("serviceA"));
        assert!(!runtime.is_running("serviceB"));

        let mut stopped = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.state == ProcessState::Stopped {
                stopped.push(event.service);
            }
        }
        assert_eq!(stopped, vec!["serviceB", "serviceA"]);
    }

    #[tokio::test]
    async fn test_up_from_manifest_builds_and_injects() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        for dir in ["servers/ga4_server", "client"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        std::fs::write(
            root.join("servers/ga4_server/Dockerfile"),
            "FROM python:3.11-slim\nWORKDIR /app\nCOPY . .\nEXPOSE 8002\nCMD [\"python\", \"main.py\"]\n",
        )
        .unwrap();
        std::fs::write(
            root.join("client/Dockerfile"),
            "FROM python:3.11-slim\nWORKDIR /app\nEXPOSE 8501\n",
        )
        .unwrap();
        std::fs::write(
            root.join("compose.yaml"),
            r#"
name: analytics
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
"#,
        )
        .unwrap();

        let runtime = MemoryRuntime::new();
        let settings = Settings::new(root.to_path_buf());
        let mut stack = Stack::load(settings, &[], Arc::new(runtime.clone())).unwrap();
        assert_eq!(stack.plan().project, "analytics");

        stack.up(true).await.unwrap();
        assert_eq!(runtime.builds().len(), 2);

        let launches = runtime.launches();
        assert_eq!(runtime.launch_order(), vec!["ga4_server", "hostclient"]);
        let server = &launches[0].spec;
        assert_eq!(server.image, "analytics-ga4_server:latest");
        assert_eq!(server.env["GOOGLE_CLOUD_PROJECT"], "analytics-demo");
        assert_eq!(server.mounts[0].target, "/app");
        assert!(server.labels["tandem.digest"].starts_with("sha256:"));
        assert_eq!(server.network, "analytics_default");

        let client = &launches[1].spec;
        assert!(client.env.is_empty());
        assert_eq!(
            client.command.as_deref(),
            Some(&["/bin/sh".to_string(), "-c".to_string(), "streamlit run app.py".to_string()][..])
        );

        stack.down().await.unwrap();
    }

    #[test]
    fn test_load_merges_overlay_files() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "name: overlay\nservices:\n  api:\n    image: api:1\n    ports:\n      - \"8002:8002\"\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join("compose.override.yaml"),
            "services:\n  api:\n    image: api:2\n  worker:\n    image: worker:1\n    depends_on:\n      - api\n",
        )
        .unwrap();

        let files = vec![
            temp.path().join("compose.yaml"),
            PathBuf::from("compose.override.yaml"),
        ];
        let stack = Stack::load(
            Settings::new(temp.path().to_path_buf()),
            &files,
            Arc::new(MemoryRuntime::new()),
        )
        .unwrap();

        let plan = stack.plan();
        assert_eq!(plan.project, "overlay");
        assert_eq!(plan.order(), vec!["api", "worker"]);
        let api = plan.service("api").unwrap();
        assert_eq!(api.source, crate::service::ArtifactSource::Image("api:2".to_string()));
        assert_eq!(api.ports.len(), 1);
    }

    #[test]
    fn test_load_rejects_repeated_service_key() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("compose.yaml"),
            "services:\n  api:\n    image: a\n    ports:\n      - \"8002:8002\"\n  api:\n    image: b\n",
        )
        .unwrap();

        let err = Stack::load(
            Settings::new(temp.path().to_path_buf()),
            &[],
            Arc::new(MemoryRuntime::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TandemError::DuplicateName { ref name, .. } if name == "api"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_load_missing_manifest() {
        let temp = tempdir().unwrap();
        let err = Stack::load(
            Settings::new(temp.path().to_path_buf()),
            &[],
            Arc::new(MemoryRuntime::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TandemError::ManifestNotFound(_)));
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_build_failure_starts_nothing() {
        let temp = tempdir().unwrap();
        let mut def = ServiceDefinition::new("serviceA", "unused");
        def.source = crate::service::ArtifactSource::Build {
            context: temp.path().join("missing"),
            recipe: temp.path().join("missing/Dockerfile"),
            args: BTreeMap::new(),
        };
        let plan = ServiceResolver::new("demo", temp.path())
            .plan(vec![def, ServiceDefinition::new("serviceB", "b")], Vec::new())
            .unwrap();

        let runtime = MemoryRuntime::new();
        let mut stack = Stack::new(plan, Settings::new(temp.path().to_path_buf()), Arc::new(runtime.clone()));
        let err = stack.up(true).await.unwrap_err();
        assert!(matches!(err, TandemError::BuildAborted { ref services } if services == &["serviceA".to_string()]));
        assert_eq!(stack.state(), ProjectState::Error);
        assert!(runtime.launches().is_empty());
        assert!(runtime.networks().is_empty());
    }

    #[tokio::test]
    async fn test_healthy_edge_waits_for_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = ServiceDefinition::new("web", "web");
        client.depends_on = vec![DependencyEdge {
            dependency: "api".to_string(),
            condition: DependencyCondition::ServiceHealthy,
        }];
        let defs = vec![ServiceDefinition::new("api", "api").port(port, 8002), client];
        let plan = ServiceResolver::new("demo", Path::new("/"))
            .plan(defs, Vec::new())
            .unwrap();

        let runtime = MemoryRuntime::new();
        let mut stack = Stack::new(plan, Settings::new(PathBuf::from("/")), Arc::new(runtime.clone()));
        stack.up(true).await.unwrap();
        assert_eq!(runtime.launch_order(), vec!["api", "web"]);
        stack.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_unready_dependency_aborts_launch() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut api = ServiceDefinition::new("api", "api").port(port, 8002);
        api.healthcheck = Some(crate::service::ReadinessProbe {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
            retries: 2,
            start_period: Duration::ZERO,
        });
        let mut web = ServiceDefinition::new("web", "web");
        web.depends_on = vec![DependencyEdge {
            dependency: "api".to_string(),
            condition: DependencyCondition::ServiceHealthy,
        }];
        let plan = ServiceResolver::new("demo", Path::new("/"))
            .plan(vec![api, web], Vec::new())
            .unwrap();

        let runtime = MemoryRuntime::new();
        let mut stack = Stack::new(plan, Settings::new(PathBuf::from("/")), Arc::new(runtime.clone()));
        let err = stack.up(true).await.unwrap_err();
        assert!(matches!(err, TandemError::DependencyNotReady { .. }));
        assert_eq!(runtime.launch_order(), vec!["api"]);
        assert_eq!(runtime.terminated(), vec!["api"]);
        assert!(runtime.networks().is_empty());
    }

    #[tokio::test]
    async fn test_down_without_up_removes_by_name() {
        let runtime = MemoryRuntime::new();
        let mut stack = two_service_stack(&runtime);
        stack.down().await.unwrap();
        assert_eq!(stack.state(), ProjectState::Stopped);
        assert!(runtime.terminated().is_empty());
        assert!(stack.status().unwrap().is_empty());
        assert!(stack.subscribe().is_none());
    }
}
