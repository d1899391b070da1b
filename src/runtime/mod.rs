//! Process runtimes
//!
//! The orchestrator never starts processes itself. It hands a fully resolved
//! [`LaunchSpec`] to a [`ContainerRuntime`] and gets back a
//! [`RunningProcess`] handle to wait on or terminate.
//!
//! Two backends are provided: [`DockerRuntime`] drives the `docker` CLI, and
//! [`MemoryRuntime`] keeps everything in memory for dry runs and tests.

pub mod docker;
pub mod memory;

pub use docker::DockerRuntime;
pub use memory::{LaunchRecord, MemoryRuntime};

use crate::error::Result;
use crate::service::{MountBinding, PortBinding};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Exit code reported when a process could not be started at all
pub const SPAWN_FAILURE_CODE: i32 = -1;

/// Request to build one service's artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Service being built
    pub service: String,
    /// Build context directory
    pub context: PathBuf,
    /// Build recipe path
    pub recipe: PathBuf,
    /// Tag the result is stored under
    pub tag: String,
    /// Build arguments
    pub args: BTreeMap<String, String>,
    /// Labels attached to the artifact
    pub labels: BTreeMap<String, String>,
}

/// Everything a runtime needs to start one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Service the process belongs to
    pub service: String,
    /// Stable process name
    pub container_name: String,
    /// Artifact to run
    pub image: String,
    /// Command override; `None` runs the artifact's default command
    pub command: Option<Vec<String>>,
    /// Literal environment
    pub env: BTreeMap<String, String>,
    /// Mounts, resolved against the working directory
    pub mounts: Vec<MountBinding>,
    /// Published ports
    pub ports: Vec<PortBinding>,
    /// Project network to join
    pub network: String,
    /// DNS names the process is reachable under on the network
    pub aliases: Vec<String>,
    /// Process labels
    pub labels: BTreeMap<String, String>,
}

/// Handle to one started process
#[async_trait]
pub trait RunningProcess: Send {
    /// Runtime identifier of the process
    fn id(&self) -> &str;

    /// Wait for the process to exit and return its exit code.
    /// Must be cancel safe: the supervisor races it against stop requests.
    async fn wait(&mut self) -> Result<i32>;

    /// Ask the process to stop, killing it once `grace` has elapsed.
    /// Returns the exit code.
    async fn terminate(&mut self, grace: Duration) -> Result<i32>;
}

/// Backend that builds artifacts and runs processes
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Create the project network
    async fn prepare(&self, network: &str) -> Result<()>;

    /// Build one artifact
    async fn build(&self, request: &BuildRequest) -> Result<()>;

    /// Start one process
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn RunningProcess>>;

    /// Remove a leftover process with this name, if any
    async fn remove(&self, container_name: &str) -> Result<()>;

    /// Remove the project network
    async fn teardown(&self, network: &str) -> Result<()>;
}
