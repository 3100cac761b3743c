//! Bridge Manager Library
//!
//! Core functionality for managing the lifecycle of bridge agent
//! containers: the deterministic image build pipeline, the runtime
//! abstraction over a local container engine and a Kubernetes cluster,
//! the background agent health monitor, and the in-place configuration
//! mutation against running agents.

pub mod agent;
pub mod build;
pub mod cloud;
pub mod error;
pub mod identity;
pub mod monitor;
pub mod retry;
pub mod runtime;
pub mod settings;

// Re-exports for convenience
pub use agent::{AgentLauncher, ConfigUpdateOutcome};
pub use build::{ArtifactStore, BuildOutcome, HttpArtifactStore, ImageBuilder};
pub use cloud::{AgentCredential, AgentReport, CloudSession, CloudStatusSource};
pub use error::{Error, Result};
pub use monitor::{HealthMonitor, HealthVerdict, MonitorConfig, MonitorDeps, MonitorState};
pub use runtime::{DockerAdapter, KubernetesAdapter, RuntimeAdapter};
pub use settings::{BuildRequest, Settings};
