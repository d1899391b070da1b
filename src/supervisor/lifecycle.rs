//! Supervised service lifecycle
//!
//! Each service gets its own task that owns its process handle, waits for
//! it to exit and applies the service's restart policy. Tasks share nothing
//! but the status table, so a crash loop in one service never delays or
//! restarts another.

use super::state::{ProcessState, ServiceStatus, SupervisorEvent};
use crate::error::{Result, TandemError};
use crate::image::Artifact;
use crate::inject::Injector;
use crate::runtime::{ContainerRuntime, RunningProcess, SPAWN_FAILURE_CODE};
use crate::service::ServiceDefinition;
use crate::settings::Settings;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Minimum pause before retrying a start that never produced a process
pub const FAILED_START_RETRY_DELAY: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 256;

type StatusTable = Arc<RwLock<HashMap<String, ServiceStatus>>>;

struct Worker {
    service: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Starts services and keeps them running according to their restart policy
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    injector: Arc<Injector>,
    table: StatusTable,
    events: broadcast::Sender<SupervisorEvent>,
    restart_delay: Duration,
    stop_timeout: Duration,
    /// Services in launch order
    order: Vec<String>,
    workers: Vec<Worker>,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, injector: Arc<Injector>, settings: &Settings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runtime,
            injector,
            table: Arc::new(RwLock::new(HashMap::new())),
            events,
            restart_delay: settings.restart_delay,
            stop_timeout: settings.stop_timeout,
            order: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Issue the first start of `def` and hand it to its own supervision
    /// task. Returns once the start command has reached the runtime, whether
    /// or not it succeeded; a failed first start is handled by the restart
    /// policy like any other exit.
    pub async fn launch(&mut self, def: ServiceDefinition, artifact: Artifact) -> Result<()> {
        if self.order.iter().any(|s| *s == def.name) {
            return Err(TandemError::Internal(format!(
                "service {} is already supervised",
                def.name
            )));
        }

        self.table
            .write()
            .map_err(|_| TandemError::Lock("Failed to acquire write lock".to_string()))?
            .insert(def.name.clone(), ServiceStatus::new(&def.name));
        self.order.push(def.name.clone());

        let task = ServiceTask {
            grace: def.stop_grace_period.unwrap_or(self.stop_timeout),
            def,
            artifact,
            runtime: Arc::clone(&self.runtime),
            injector: Arc::clone(&self.injector),
            table: Arc::clone(&self.table),
            events: self.events.clone(),
            restart_delay: self.restart_delay,
        };

        let first = task.start().await;
        let (stop, stop_rx) = watch::channel(false);
        let service = task.def.name.clone();
        let handle = tokio::spawn(task.run(first, stop_rx));
        self.workers.push(Worker {
            service,
            stop,
            handle,
        });
        Ok(())
    }

    /// Stop one service and wait for its task to finish
    pub async fn stop(&mut self, service: &str) -> Result<()> {
        let index = self
            .workers
            .iter()
            .position(|w| w.service == service)
            .ok_or_else(|| TandemError::ServiceNotFound(service.to_string()))?;
        let worker = self.workers.remove(index);

        tracing::info!("Stopping {}", service);
        let _ = worker.stop.send(true);
        worker
            .handle
            .await
            .map_err(|e| TandemError::Internal(format!("supervisor task for {} failed: {}", service, e)))
    }

    /// Stop the named services one after another, then anything else still
    /// supervised. A failure to stop one service does not keep the rest
    /// running; the first error is returned once every task has ended.
    pub async fn stop_all(&mut self, order: &[&str]) -> Result<()> {
        let mut first_error = None;
        let remaining: Vec<String> = order
            .iter()
            .filter(|service| self.workers.iter().any(|w| w.service == **service))
            .map(|service| service.to_string())
            .chain(self.workers.iter().rev().map(|w| w.service.clone()))
            .collect();

        for service in remaining {
            if !self.workers.iter().any(|w| w.service == service) {
                continue;
            }
            if let Err(e) = self.stop(&service).await {
                tracing::warn!("Failed to stop {}: {}", service, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Status of every service, in launch order
    pub fn status(&self) -> Result<Vec<ServiceStatus>> {
        let table = self
            .table
            .read()
            .map_err(|_| TandemError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(self
            .order
            .iter()
            .filter_map(|name| table.get(name).cloned())
            .collect())
    }

    /// Status of one service
    pub fn status_of(&self, service: &str) -> Result<ServiceStatus> {
        let table = self
            .table
            .read()
            .map_err(|_| TandemError::Lock("Failed to acquire read lock".to_string()))?;
        table
            .get(service)
            .cloned()
            .ok_or_else(|| TandemError::ServiceNotFound(service.to_string()))
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Number of services with a live supervision task
    pub fn supervised(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.abort();
        }
    }
}

/// State owned by one service's supervision task
struct ServiceTask {
    def: ServiceDefinition,
    artifact: Artifact,
    runtime: Arc<dyn ContainerRuntime>,
    injector: Arc<Injector>,
    table: StatusTable,
    events: broadcast::Sender<SupervisorEvent>,
    restart_delay: Duration,
    grace: Duration,
}

impl ServiceTask {
    /// Apply a state transition to the status row and broadcast it
    fn transition<F>(&self, state: ProcessState, update: F)
    where
        F: FnOnce(&mut ServiceStatus),
    {
        let exit_code = {
            let Ok(mut table) = self.table.write() else {
                tracing::error!("Status table lock poisoned, {} now {}", self.def.name, state);
                return;
            };
            let status = table
                .entry(self.def.name.clone())
                .or_insert_with(|| ServiceStatus::new(&self.def.name));
            if !status.state.can_transition_to(state) {
                tracing::warn!(
                    "Service {}: unexpected transition {} -> {}",
                    self.def.name,
                    status.state,
                    state
                );
            }
            status.state = state;
            update(status);
            status.last_exit
        };

        let _ = self.events.send(SupervisorEvent {
            service: self.def.name.clone(),
            state,
            exit_code: (state == ProcessState::Exited).then_some(exit_code).flatten(),
            at: Utc::now(),
        });
    }

    /// Issue one start command
    async fn start(&self) -> Result<Box<dyn RunningProcess>> {
        self.transition(ProcessState::Starting, |s| s.launches += 1);

        if let Err(e) = self.runtime.remove(&self.def.container_name).await {
            tracing::warn!("Service {}: {}", self.def.name, e);
        }
        let spec = self.injector.launch_spec(&self.def, &self.artifact).await?;
        let process = self.runtime.spawn(&spec).await?;

        let id = process.id().to_string();
        tracing::info!("Started {} ({})", self.def.name, id);
        self.transition(ProcessState::Running, |s| {
            s.started_at = Some(Utc::now());
            s.process_id = Some(id);
        });
        Ok(process)
    }

    /// Supervision loop: wait for exit, consult the restart policy, relaunch
    async fn run(self, first: Result<Box<dyn RunningProcess>>, mut stop: watch::Receiver<bool>) {
        let mut current = first;
        let mut restarts = 0u32;

        loop {
            let (code, failed_start) = match current {
                Ok(mut process) => {
                    tokio::select! {
                        result = process.wait() => match result {
                            Ok(code) => (code, false),
                            Err(e) => {
                                tracing::warn!("Service {}: {}", self.def.name, e);
                                (SPAWN_FAILURE_CODE, false)
                            }
                        },
                        _ = stop.changed() => {
                            self.shutdown(process).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    (SPAWN_FAILURE_CODE, true)
                }
            };

            self.transition(ProcessState::Exited, |s| {
                s.last_exit = Some(code);
                s.process_id = None;
            });

            if *stop.borrow() {
                self.transition(ProcessState::Stopped, |_| {});
                return;
            }
            if !self.def.restart.should_restart(code, restarts) {
                tracing::info!(
                    "Service {} exited with code {}, restart policy '{}' leaves it stopped",
                    self.def.name,
                    code,
                    self.def.restart
                );
                self.transition(ProcessState::Stopped, |_| {});
                return;
            }

            restarts += 1;
            tracing::warn!(
                "Service {} exited with code {}, restarting (restart {})",
                self.def.name,
                code,
                restarts
            );

            let delay = if failed_start {
                self.restart_delay.max(FAILED_START_RETRY_DELAY)
            } else {
                self.restart_delay
            };
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => {
                        self.transition(ProcessState::Stopped, |_| {});
                        return;
                    }
                }
            }

            self.update_restarts(restarts);
            current = self.start().await;
        }
    }

    fn update_restarts(&self, restarts: u32) {
        if let Ok(mut table) = self.table.write() {
            if let Some(status) = table.get_mut(&self.def.name) {
                status.restarts = restarts;
            }
        }
    }

    /// Terminate the running process on a stop request
    async fn shutdown(&self, mut process: Box<dyn RunningProcess>) {
        let code = match process.terminate(self.grace).await {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!("Service {}: {}", self.def.name, e);
                None
            }
        };
        self.transition(ProcessState::Exited, |s| {
            s.last_exit = code;
            s.process_id = None;
        });
        self.transition(ProcessState::Stopped, |_| {});
        tracing::info!("Stopped {}", self.def.name);
    }
}
