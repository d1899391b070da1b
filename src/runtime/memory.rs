//! In-memory backend
//!
//! Records every build and start instead of performing it. Started processes
//! stay "running" until [`MemoryRuntime::crash`] or a terminate request ends
//! them. Used by `up --dry-run` and by the supervisor tests.

use super::{BuildRequest, ContainerRuntime, LaunchSpec, RunningProcess};
use crate::error::{Result, TandemError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// One recorded start command
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub service: String,
    /// 1 for the first start of the service, 2 for its first restart, ...
    pub attempt: u32,
    pub spec: LaunchSpec,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    networks: Vec<String>,
    builds: Vec<BuildRequest>,
    launches: Vec<LaunchRecord>,
    terminated: Vec<String>,
    failing_builds: HashSet<String>,
    failing_spawns: HashSet<String>,
    live: HashMap<String, mpsc::UnboundedSender<i32>>,
}

/// Backend that only records what it is asked to do
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TandemError::Lock("Failed to acquire memory runtime lock".to_string()))
    }

    /// Make every build of `service` fail
    pub fn fail_build(&self, service: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_builds.insert(service.to_string());
        }
    }

    /// Make every start of `service` fail
    pub fn fail_spawn(&self, service: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_spawns.insert(service.to_string());
        }
    }

    /// Let starts of `service` succeed again
    pub fn heal(&self, service: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_spawns.remove(service);
            state.failing_builds.remove(service);
        }
    }

    /// End the running process of `service` with `code`.
    /// Returns false if the service has no running process.
    pub fn crash(&self, service: &str, code: i32) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        match state.live.remove(service) {
            Some(tx) => tx.send(code).is_ok(),
            None => false,
        }
    }

    /// Whether `service` currently has a running process
    pub fn is_running(&self, service: &str) -> bool {
        self.lock()
            .map(|state| state.live.contains_key(service))
            .unwrap_or(false)
    }

    /// All start commands, in the order they were issued
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock()
            .map(|state| state.launches.clone())
            .unwrap_or_default()
    }

    /// Service names in start-command order
    pub fn launch_order(&self) -> Vec<String> {
        self.launches().into_iter().map(|l| l.service).collect()
    }

    /// Number of start commands issued for `service`
    pub fn launch_count(&self, service: &str) -> usize {
        self.lock()
            .map(|state| state.launches.iter().filter(|l| l.service == service).count())
            .unwrap_or(0)
    }

    /// Build requests received
    pub fn builds(&self) -> Vec<BuildRequest> {
        self.lock()
            .map(|state| state.builds.clone())
            .unwrap_or_default()
    }

    /// Services whose processes were terminated, in order
    pub fn terminated(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.terminated.clone())
            .unwrap_or_default()
    }

    /// Networks currently prepared
    pub fn networks(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.networks.clone())
            .unwrap_or_default()
    }

    /// Wait until `service` has been started at least `count` times and
    /// its latest process is running
    pub async fn wait_for_launches(&self, service: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.launch_count(service) >= count && self.is_running(service) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    async fn prepare(&self, network: &str) -> Result<()> {
        let mut state = self.lock()?;
        if !state.networks.iter().any(|n| n == network) {
            state.networks.push(network.to_string());
        }
        Ok(())
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        let mut state = self.lock()?;
        state.builds.push(request.clone());
        if state.failing_builds.contains(&request.service) {
            return Err(TandemError::Build {
                service: request.service.clone(),
                message: "build recipe step failed".to_string(),
            });
        }
        Ok(())
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn RunningProcess>> {
        let mut state = self.lock()?;
        if state.failing_spawns.contains(&spec.service) {
            return Err(TandemError::Spawn {
                service: spec.service.clone(),
                message: "simulated start failure".to_string(),
            });
        }

        let attempt = state
            .launches
            .iter()
            .filter(|l| l.service == spec.service)
            .count() as u32
            + 1;
        state.launches.push(LaunchRecord {
            service: spec.service.clone(),
            attempt,
            spec: spec.clone(),
            at: Utc::now(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        state.live.insert(spec.service.clone(), tx);

        Ok(Box::new(MemoryProcess {
            id: format!("{}#{}", spec.container_name, attempt),
            service: spec.service.clone(),
            exits: rx,
            state: Arc::clone(&self.state),
        }))
    }

    async fn remove(&self, _container_name: &str) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self, network: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.networks.retain(|n| n != network);
        Ok(())
    }
}

struct MemoryProcess {
    id: String,
    service: String,
    exits: mpsc::UnboundedReceiver<i32>,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl RunningProcess for MemoryProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> Result<i32> {
        self.exits
            .recv()
            .await
            .ok_or_else(|| TandemError::Runtime(format!("{} vanished", self.id)))
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<i32> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TandemError::Lock("Failed to acquire memory runtime lock".to_string()))?;
        state.live.remove(&self.service);
        state.terminated.push(self.service.clone());
        Ok(0)
    }
}
