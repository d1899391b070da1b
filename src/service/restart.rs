//! Restart policies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rule deciding whether a supervised process is relaunched after it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RestartPolicy {
    /// Never relaunch
    #[default]
    No,
    /// Relaunch after every exit, indefinitely
    Always,
    /// Relaunch after a non-zero exit, optionally bounded
    OnFailure { max_retries: Option<u32> },
    /// Same as `Always` for the lifetime of one orchestrator invocation
    UnlessStopped,
}

impl RestartPolicy {
    /// Whether a process that exited with `exit_code` after `restarts`
    /// previous relaunches should be started again.
    pub fn should_restart(&self, exit_code: i32, restarts: u32) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure { max_retries } => {
                exit_code != 0 && max_retries.map_or(true, |max| restarts < max)
            }
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no" | "\"no\"" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure { max_retries: None }),
            other => match other.strip_prefix("on-failure:") {
                Some(max) => max
                    .parse()
                    .map(|n| RestartPolicy::OnFailure { max_retries: Some(n) })
                    .map_err(|_| format!("invalid retry count '{}'", max)),
                None => Err(format!("unknown restart policy '{}'", other)),
            },
        }
    }
}

impl TryFrom<String> for RestartPolicy {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RestartPolicy> for String {
    fn from(policy: RestartPolicy) -> Self {
        policy.to_string()
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure { max_retries: None } => write!(f, "on-failure"),
            RestartPolicy::OnFailure { max_retries: Some(n) } => write!(f, "on-failure:{}", n),
        }
    }
}
