//! Environment and mount injection
//!
//! Turns a service definition plus its built artifact into the concrete
//! [`LaunchSpec`] handed to the runtime on every start attempt.

pub mod credentials;

pub use credentials::{CredentialProvider, EnvCredential, MountCredential, RemoteCredential};

use crate::compose::resolver::LaunchPlan;
use crate::error::Result;
use crate::image::stage::DIGEST_LABEL;
use crate::image::Artifact;
use crate::runtime::LaunchSpec;
use crate::service::{MountBinding, ServiceDefinition};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Label naming the project a process belongs to
pub const PROJECT_LABEL: &str = "tandem.project";
/// Label naming the service a process runs
pub const SERVICE_LABEL: &str = "tandem.service";

/// Material collected for one start attempt
#[derive(Debug, Clone, Default)]
pub struct Injection {
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountBinding>,
}

/// Builds launch specs for every service of a plan
pub struct Injector {
    project: String,
    network: String,
    providers: HashMap<String, Vec<Box<dyn CredentialProvider>>>,
}

impl Injector {
    /// Create an injector with the credential providers each service declares
    pub fn new(plan: &LaunchPlan, working_dir: &Path) -> Result<Self> {
        let mut providers: HashMap<String, Vec<Box<dyn CredentialProvider>>> = HashMap::new();
        for def in &plan.services {
            for config in &def.credentials {
                let provider = credentials::provider_for(&def.name, config, working_dir)?;
                providers.entry(def.name.clone()).or_default().push(provider);
            }
        }

        Ok(Self {
            project: plan.project.clone(),
            network: plan.network.clone(),
            providers,
        })
    }

    /// Add a provider for `service`
    pub fn with_provider(mut self, service: &str, provider: Box<dyn CredentialProvider>) -> Self {
        self.providers
            .entry(service.to_string())
            .or_default()
            .push(provider);
        self
    }

    /// Launch spec for one start attempt. Credential providers run every
    /// time this is called.
    pub async fn launch_spec(
        &self,
        def: &ServiceDefinition,
        artifact: &Artifact,
    ) -> Result<LaunchSpec> {
        let mut injection = Injection {
            env: def
                .environment
                .iter()
                .map(|b| (b.key.clone(), b.value.clone()))
                .collect(),
            mounts: def.mounts.clone(),
        };

        for provider in self.providers.get(&def.name).into_iter().flatten() {
            tracing::debug!("Service {}: running {} credential provider", def.name, provider.kind());
            provider.provide(&def.name, &mut injection).await?;
        }

        let mut labels = def.labels.clone();
        labels.insert(PROJECT_LABEL.to_string(), self.project.clone());
        labels.insert(SERVICE_LABEL.to_string(), def.name.clone());
        if let Some(digest) = &artifact.digest {
            labels.insert(DIGEST_LABEL.to_string(), digest.clone());
        }

        Ok(LaunchSpec {
            service: def.name.clone(),
            container_name: def.container_name.clone(),
            image: artifact.image.clone(),
            command: def
                .command
                .clone()
                .or_else(|| artifact.default_command.clone()),
            env: injection.env,
            mounts: injection.mounts,
            ports: def.ports.clone(),
            network: self.network.clone(),
            aliases: vec![def.name.clone()],
            labels,
        })
    }
}
