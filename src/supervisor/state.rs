//! Per-service process state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Not running and not going to be started
    Stopped,
    /// Start command being issued
    Starting,
    /// Process is running
    Running,
    /// Process ended; restart policy decides what comes next
    Exited,
}

impl ProcessState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Exited)
                | (Starting, Stopped)
                | (Running, Exited)
                | (Exited, Starting)
                | (Exited, Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
        }
    }
}

/// Status row for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service name
    pub service: String,
    /// Current state
    pub state: ProcessState,
    /// Start commands issued, including the first
    pub launches: u32,
    /// Restarts performed by the restart policy
    pub restarts: u32,
    /// Exit code of the last process
    pub last_exit: Option<i32>,
    /// When the current process was started
    pub started_at: Option<DateTime<Utc>>,
    /// Runtime identifier of the current process
    pub process_id: Option<String>,
}

impl ServiceStatus {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            state: ProcessState::Stopped,
            launches: 0,
            restarts: 0,
            last_exit: None,
            started_at: None,
            process_id: None,
        }
    }
}

/// Broadcast on every state transition
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub service: String,
    pub state: ProcessState,
    /// Set on transitions to `Exited`
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}
