//! Runtime module
//!
//! Abstraction over the two interchangeable agent runtimes (local container
//! engine, Kubernetes cluster) through a common RuntimeAdapter trait. The
//! backend is selected once at composition time.

pub mod adapter;
pub mod docker;
pub mod kubernetes;

pub use adapter::{
    AgentContainer, ContainerStatus, ExecOutput, LaunchSpec, ResourceUsage, RuntimeAdapter,
    StopOutcome, VolumeBinding,
};
pub use docker::DockerAdapter;
pub use kubernetes::KubernetesAdapter;
