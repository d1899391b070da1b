//! Service definitions
//!
//! The immutable, validated form of a manifest entry: what to build or run,
//! how to restart it, and which environment, mounts, ports and start-order
//! edges apply to it.

pub mod binding;
pub mod definition;
pub mod restart;

pub use binding::{EnvBinding, MountBinding, MountSource, PortBinding, Protocol};
pub use definition::{
    ArtifactSource, DependencyCondition, DependencyEdge, ReadinessProbe, ServiceDefinition,
};
pub use restart::RestartPolicy;
