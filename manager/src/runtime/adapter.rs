//! Runtime Adapter Trait
//!
//! Defines the common capability set both agent runtimes implement. Every
//! query is scoped to managed containers (the `bridge_` identity prefix),
//! "not found" is a normal result rather than an error, and all display
//! facts come from the label map attached at creation so both backends
//! produce structurally identical detail views.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::identity::label_keys;

/// Container/pod status, normalized across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
            ContainerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Volume binding configuration.
#[derive(Debug, Clone)]
pub struct VolumeBinding {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to start one agent container. Built by the launcher;
/// the adapters translate it without adding business semantics.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Container/pod name, from the identity scheme.
    pub identity: String,
    /// Image tag to run.
    pub image: String,
    /// The fixed label mapping, attached at creation and immutable after.
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeBinding>,
    /// Extra host -> address entries.
    pub dns_mappings: HashMap<String, String>,
    /// "bridge", "host", or a custom network name.
    pub network_mode: Option<String>,
}

/// A managed container as reported by either backend.
#[derive(Debug, Clone)]
pub struct AgentContainer {
    pub identity: String,
    pub image: Option<String>,
    pub status: ContainerStatus,
    pub started_at: Option<String>,
    pub labels: HashMap<String, String>,
    pub volume_mounts: Vec<String>,
    pub network_mode: Option<String>,
}

impl AgentContainer {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.label(label_keys::AGENT_NAME)
    }

    pub fn site_name(&self) -> Option<&str> {
        self.label(label_keys::SITE_NAME)
    }

    pub fn server_url(&self) -> Option<&str> {
        self.label(label_keys::SERVER_URL)
    }

    pub fn pool_name(&self) -> Option<&str> {
        self.label(label_keys::POOL_NAME)
    }

    pub fn drivers(&self) -> Vec<&str> {
        self.label(label_keys::DATABASE_DRIVERS)
            .map(|d| d.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn package_version(&self) -> Option<&str> {
        self.label(label_keys::PACKAGE_VERSION)
    }

    pub fn logs_path(&self) -> Option<&str> {
        self.label(label_keys::LOGS_PATH)
    }

    pub fn run_as_user(&self) -> Option<&str> {
        self.label(label_keys::RUN_AS_USER)
    }
}

/// Captured result of a command executed inside a container. Exit-code
/// interpretation is left to the caller.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Result of a stop request. An absent identity is a normal outcome so
/// callers can render "not running" instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotFound,
}

/// Best-effort resource usage. Zeroed for stopped containers and for
/// backends without a stats source.
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub cpu_pct: f64,
    pub mem_usage_mb: f64,
    pub disk_usage: String,
}

/// Runtime adapter trait - common capability set for both agent runtimes.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Backend name for logs and display.
    fn runtime_type(&self) -> &str;

    /// Check that the runtime can be reached. Used as a pre-flight gate by
    /// operations that must not start work against a dead backend.
    async fn ping(&self) -> Result<()>;

    /// Create and start an agent container. Fails with `AlreadyRunning` if
    /// the identity already exists. Returns the backend-native id.
    async fn create(&self, spec: &LaunchSpec) -> Result<String>;

    /// List managed containers, at most one entry per identity.
    async fn list(&self) -> Result<Vec<AgentContainer>>;

    /// Look up one managed container. `Ok(None)` for absent identities;
    /// transport errors propagate.
    async fn inspect(&self, identity: &str) -> Result<Option<AgentContainer>>;

    /// Stop and then forcibly remove a container, tolerating one that is
    /// already stopped.
    async fn stop(&self, identity: &str) -> Result<StopOutcome>;

    /// Execute a command inside a running container and capture its output.
    async fn exec(&self, identity: &str, cmd: Vec<String>) -> Result<ExecOutput>;

    /// Fetch container stdout/stderr log lines.
    async fn logs(&self, identity: &str, tail: Option<usize>) -> Result<Vec<String>>;

    /// Stream a file or directory archive out of the container to a
    /// caller-supplied destination, without buffering it in memory.
    async fn copy_file_out(&self, identity: &str, path: &str, dest: &Path) -> Result<()>;

    /// Best-effort CPU/memory/disk usage. Zeroed for stopped containers.
    async fn usage(&self, identity: &str) -> Result<ResourceUsage>;
}

/// True when a container name carries the managed prefix.
pub fn is_managed_name(name: &str) -> bool {
    name.starts_with(crate::identity::CONTAINER_PREFIX)
}

/// Helper for pretty-printing label maps in detail views.
pub fn describe(container: &AgentContainer) -> String {
    let mut out = String::new();
    out.push_str(&format!("identity:  {}\n", container.identity));
    out.push_str(&format!("status:    {}\n", container.status));
    if let Some(image) = &container.image {
        out.push_str(&format!("image:     {}\n", image));
    }
    if let Some(agent) = container.agent_name() {
        out.push_str(&format!("agent:     {}\n", agent));
    }
    if let Some(site) = container.site_name() {
        out.push_str(&format!("site:      {}\n", site));
    }
    if let Some(pool) = container.pool_name() {
        out.push_str(&format!("pool:      {}\n", pool));
    }
    let drivers = container.drivers();
    if !drivers.is_empty() {
        out.push_str(&format!("drivers:   {}\n", drivers.join(", ")));
    }
    if let Some(logs) = container.logs_path() {
        out.push_str(&format!("logs path: {}\n", logs));
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted adapter stub shared by module tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct StubAdapter {
        /// Containers the stub pretends exist, keyed by identity.
        pub containers: Mutex<HashMap<String, AgentContainer>>,
        /// Scripted exec results, consumed front to back.
        pub exec_results: Mutex<Vec<Result<ExecOutput>>>,
        /// Exec invocations observed.
        pub exec_calls: Mutex<Vec<Vec<String>>>,
    }

    impl StubAdapter {
        pub fn with_container(identity: &str, labels: HashMap<String, String>) -> Self {
            let stub = Self::default();
            stub.containers.lock().insert(
                identity.to_string(),
                AgentContainer {
                    identity: identity.to_string(),
                    image: Some("agent_rhel9".to_string()),
                    status: ContainerStatus::Running,
                    started_at: None,
                    labels,
                    volume_mounts: Vec::new(),
                    network_mode: None,
                },
            );
            stub
        }

        pub fn script_exec(&self, results: Vec<Result<ExecOutput>>) {
            *self.exec_results.lock() = results;
        }
    }

    #[async_trait]
    impl RuntimeAdapter for StubAdapter {
        fn runtime_type(&self) -> &str {
            "stub"
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn create(&self, spec: &LaunchSpec) -> Result<String> {
            let mut containers = self.containers.lock();
            if containers.contains_key(&spec.identity) {
                return Err(crate::error::Error::AlreadyRunning(spec.identity.clone()));
            }
            containers.insert(
                spec.identity.clone(),
                AgentContainer {
                    identity: spec.identity.clone(),
                    image: Some(spec.image.clone()),
                    status: ContainerStatus::Running,
                    started_at: None,
                    labels: spec.labels.clone(),
                    volume_mounts: Vec::new(),
                    network_mode: spec.network_mode.clone(),
                },
            );
            Ok(spec.identity.clone())
        }

        async fn list(&self) -> Result<Vec<AgentContainer>> {
            let mut all: Vec<AgentContainer> =
                self.containers.lock().values().cloned().collect();
            all.sort_by(|a, b| a.identity.cmp(&b.identity));
            Ok(all)
        }

        async fn inspect(&self, identity: &str) -> Result<Option<AgentContainer>> {
            Ok(self.containers.lock().get(identity).cloned())
        }

        async fn stop(&self, identity: &str) -> Result<StopOutcome> {
            match self.containers.lock().remove(identity) {
                Some(_) => Ok(StopOutcome::Stopped),
                None => Ok(StopOutcome::NotFound),
            }
        }

        async fn exec(&self, _identity: &str, cmd: Vec<String>) -> Result<ExecOutput> {
            self.exec_calls.lock().push(cmd);
            let mut results = self.exec_results.lock();
            if results.is_empty() {
                return Ok(ExecOutput::default());
            }
            results.remove(0)
        }

        async fn logs(&self, _identity: &str, _tail: Option<usize>) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn copy_file_out(&self, _identity: &str, _path: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }

        async fn usage(&self, _identity: &str) -> Result<ResourceUsage> {
            Ok(ResourceUsage::default())
        }
    }
}
