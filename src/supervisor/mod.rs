//! Process supervision
//!
//! Per-service state machine: `stopped → starting → running → exited`, then
//! back to `starting` when the restart policy asks for it, or `stopped`.

pub mod lifecycle;
pub mod readiness;
pub mod state;

pub use lifecycle::Supervisor;
pub use readiness::{probe_addr, wait_ready};
pub use state::{ProcessState, ServiceStatus, SupervisorEvent};
