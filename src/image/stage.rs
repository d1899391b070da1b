//! Build stage
//!
//! Produces one [`Artifact`] per service before anything starts. Every
//! service is attempted; if any of them fails the whole launch is aborted
//! with the list of failed services.

use super::recipe::BuildRecipe;
use crate::compose::resolver::LaunchPlan;
use crate::error::{Result, TandemError};
use crate::runtime::{BuildRequest, ContainerRuntime};
use crate::service::{ArtifactSource, ServiceDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Label carrying the context digest on artifacts and processes
pub const DIGEST_LABEL: &str = "tandem.digest";

/// Runnable result of the build stage for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Service the artifact belongs to
    pub service: String,
    /// Image reference to run
    pub image: String,
    /// SHA-256 over the build context, for built artifacts
    pub digest: Option<String>,
    /// Ports the recipe declares with EXPOSE
    pub exposed_ports: Vec<u16>,
    /// Default launch command from the recipe
    pub default_command: Option<Vec<String>>,
}

impl Artifact {
    /// Artifact for a service that runs a prebuilt image
    pub fn prebuilt(service: &str, image: &str) -> Self {
        Self {
            service: service.to_string(),
            image: image.to_string(),
            digest: None,
            exposed_ports: Vec::new(),
            default_command: None,
        }
    }

    /// Published container ports the recipe does not EXPOSE. Empty when the
    /// recipe declares no ports at all.
    pub fn undeclared_ports(&self, def: &ServiceDefinition) -> Vec<u16> {
        if self.exposed_ports.is_empty() {
            return Vec::new();
        }
        def.ports
            .iter()
            .map(|p| p.container_port)
            .filter(|port| !self.exposed_ports.contains(port))
            .collect()
    }
}

/// Builds every service's artifact through a runtime
pub struct BuildStage {
    runtime: Arc<dyn ContainerRuntime>,
    project: String,
}

impl BuildStage {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, project: &str) -> Self {
        Self {
            runtime,
            project: project.to_string(),
        }
    }

    /// Tag a built service is stored under
    pub fn tag(&self, service: &str) -> String {
        format!("{}-{}:latest", self.project, service)
    }

    /// Build the services named in `only` (all services when empty).
    /// Fails with [`TandemError::BuildAborted`] if any build failed.
    pub async fn build_all(
        &self,
        plan: &LaunchPlan,
        only: &[String],
    ) -> Result<BTreeMap<String, Artifact>> {
        for name in only {
            plan.service(name)?;
        }

        let mut artifacts = BTreeMap::new();
        let mut failed = Vec::new();

        for def in &plan.services {
            if !only.is_empty() && !only.contains(&def.name) {
                continue;
            }
            match self.build_service(def).await {
                Ok(artifact) => {
                    let undeclared = artifact.undeclared_ports(def);
                    if !undeclared.is_empty() {
                        tracing::warn!(
                            "Service {} publishes container ports {:?} its recipe does not EXPOSE",
                            def.name,
                            undeclared
                        );
                    }
                    artifacts.insert(def.name.clone(), artifact);
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    failed.push(def.name.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(TandemError::BuildAborted { services: failed });
        }
        Ok(artifacts)
    }

    /// Produce the artifact for one service
    pub async fn build_service(&self, def: &ServiceDefinition) -> Result<Artifact> {
        let (context, recipe_path, args) = match &def.source {
            ArtifactSource::Image(image) => return Ok(Artifact::prebuilt(&def.name, image)),
            ArtifactSource::Build {
                context,
                recipe,
                args,
            } => (context, recipe, args),
        };

        let failed = |message: String| TandemError::Build {
            service: def.name.clone(),
            message,
        };

        if !context.is_dir() {
            return Err(failed(format!(
                "build context {} does not exist",
                context.display()
            )));
        }
        if !recipe_path.is_file() {
            return Err(failed(format!(
                "build recipe {} not found",
                recipe_path.display()
            )));
        }
        let recipe = BuildRecipe::parse_file(recipe_path).map_err(|e| failed(e.to_string()))?;

        let owned_context: PathBuf = context.clone();
        let digest = tokio::task::spawn_blocking(move || context_digest(&owned_context))
            .await
            .map_err(|e| TandemError::Internal(format!("digest task failed: {}", e)))?
            .map_err(|e| failed(e.to_string()))?;

        let tag = self.tag(&def.name);
        let mut labels = BTreeMap::new();
        labels.insert("tandem.project".to_string(), self.project.clone());
        labels.insert("tandem.service".to_string(), def.name.clone());
        labels.insert(DIGEST_LABEL.to_string(), digest.clone());

        let request = BuildRequest {
            service: def.name.clone(),
            context: context.clone(),
            recipe: recipe_path.clone(),
            tag: tag.clone(),
            args: args.clone(),
            labels,
        };
        self.runtime.build(&request).await?;
        tracing::info!("Built {} ({})", tag, digest);

        Ok(Artifact {
            service: def.name.clone(),
            image: tag,
            digest: Some(digest),
            exposed_ports: recipe.exposed_ports(),
            default_command: recipe.default_command(),
        })
    }

    /// Artifacts for `up --no-build`: built services are expected to exist
    /// under their tag already.
    pub fn existing(&self, plan: &LaunchPlan) -> BTreeMap<String, Artifact> {
        plan.services
            .iter()
            .map(|def| {
                let artifact = match &def.source {
                    ArtifactSource::Image(image) => Artifact::prebuilt(&def.name, image),
                    ArtifactSource::Build { .. } => {
                        Artifact::prebuilt(&def.name, &self.tag(&def.name))
                    }
                };
                (def.name.clone(), artifact)
            })
            .collect()
    }
}

/// SHA-256 over every file below `context`: relative path and contents,
/// in file name order. `.git` directories are skipped.
pub fn context_digest(context: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    let walker = WalkDir::new(context)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(context).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        let mut file = std::fs::File::open(entry.path())?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::resolver::ServiceResolver;
    use crate::runtime::MemoryRuntime;
    use tempfile::tempdir;

    fn build_def(name: &str, context: &Path) -> ServiceDefinition {
        let mut def = ServiceDefinition::new(name, "unused");
        def.source = ArtifactSource::Build {
            context: context.to_path_buf(),
            recipe: context.join("Dockerfile"),
            args: BTreeMap::new(),
        };
        def
    }

    fn write_context(dir: &Path, recipe: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("Dockerfile"), recipe).unwrap();
        std::fs::write(dir.join("main.py"), "print('hi')\n").unwrap();
    }

    #[tokio::test]
    async fn test_build_all_produces_tagged_artifacts() {
        let temp = tempdir().unwrap();
        let server = temp.path().join("server");
        write_context(&server, "FROM python:3.11\nEXPOSE 8002\nCMD [\"python\", \"main.py\"]\n");

        let defs = vec![
            build_def("ga4_server", &server).port(8002, 8002),
            ServiceDefinition::new("cache", "redis:7"),
        ];
        let plan = ServiceResolver::new("demo", temp.path()).plan(defs, Vec::new()).unwrap();

        let runtime = MemoryRuntime::new();
        let stage = BuildStage::new(Arc::new(runtime.clone()), "demo");
        let artifacts = stage.build_all(&plan, &[]).await.unwrap();

        let server = &artifacts["ga4_server"];
        assert_eq!(server.image, "demo-ga4_server:latest");
        assert!(server.digest.as_deref().unwrap().starts_with("sha256:"));
        assert_eq!(server.exposed_ports, vec![8002]);
        assert_eq!(artifacts["cache"], Artifact::prebuilt("cache", "redis:7"));

        let builds = runtime.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].labels[DIGEST_LABEL], server.digest.clone().unwrap());
    }

    #[tokio::test]
    async fn test_failed_build_aborts_after_building_the_rest() {
        let temp = tempdir().unwrap();
        let client = temp.path().join("client");
        let server = temp.path().join("server");
        write_context(&client, "FROM python:3.11\n");
        write_context(&server, "FROM python:3.11\n");

        let defs = vec![
            build_def("missing", &temp.path().join("nope")),
            build_def("ga4_server", &server),
            build_def("hostclient", &client),
        ];
        let plan = ServiceResolver::new("demo", temp.path()).plan(defs, Vec::new()).unwrap();

        let runtime = MemoryRuntime::new();
        runtime.fail_build("ga4_server");
        let stage = BuildStage::new(Arc::new(runtime.clone()), "demo");

        match stage.build_all(&plan, &[]).await.unwrap_err() {
            TandemError::BuildAborted { services } => {
                assert_eq!(services, vec!["missing".to_string(), "ga4_server".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
        let built: Vec<String> = runtime.builds().into_iter().map(|b| b.service).collect();
        assert_eq!(built, vec!["ga4_server".to_string(), "hostclient".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_recipe_fails_that_service() {
        let temp = tempdir().unwrap();
        let ctx = temp.path().join("bad");
        write_context(&ctx, "RUN echo no base\n");

        let stage = BuildStage::new(Arc::new(MemoryRuntime::new()), "demo");
        let err = stage.build_service(&build_def("bad", &ctx)).await.unwrap_err();
        assert!(matches!(err, TandemError::Build { ref service, .. } if service == "bad"));
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn test_build_selected_services_only() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a");
        write_context(&a, "FROM alpine\n");
        let defs = vec![build_def("a", &a), build_def("b", &temp.path().join("missing"))];
        let plan = ServiceResolver::new("demo", temp.path()).plan(defs, Vec::new()).unwrap();

        let stage = BuildStage::new(Arc::new(MemoryRuntime::new()), "demo");
        let artifacts = stage.build_all(&plan, &["a".to_string()]).await.unwrap();
        assert_eq!(artifacts.len(), 1);

        let err = stage.build_all(&plan, &["nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, TandemError::ServiceNotFound(_)));
    }

    #[test]
    fn test_context_digest_tracks_content() {
        let temp = tempdir().unwrap();
        write_context(temp.path(), "FROM alpine\n");
        let first = context_digest(temp.path()).unwrap();
        assert_eq!(first, context_digest(temp.path()).unwrap());

        std::fs::create_dir_all(temp.path().join(".git")).unwrap();
        std::fs::write(temp.path().join(".git/HEAD"), "ref: main").unwrap();
        assert_eq!(first, context_digest(temp.path()).unwrap());

        std::fs::write(temp.path().join("main.py"), "print('changed')\n").unwrap();
        assert_ne!(first, context_digest(temp.path()).unwrap());
    }

    #[test]
    fn test_undeclared_ports() {
        let mut artifact = Artifact::prebuilt("a", "a");
        let def = ServiceDefinition::new("a", "a").port(8501, 8501);
        assert!(artifact.undeclared_ports(&def).is_empty());
        artifact.exposed_ports = vec![8002];
        assert_eq!(artifact.undeclared_ports(&def), vec![8501]);
    }
}
