//! Settings module
//!
//! Handles loading and validating manager configuration from TOML files.
//! The `[build]` table is the build request consumed by the image pipeline;
//! the pipeline itself treats it as a read-only value per build.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::cloud::{AgentCredential, ADMIN_CREDENTIAL_PREFIX};

/// Where the package artifact comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageSource {
    /// Published release download site.
    #[default]
    Release,
    /// Nightly build channel.
    Nightly,
}

impl fmt::Display for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageSource::Release => write!(f, "release"),
            PackageSource::Nightly => write!(f, "nightly"),
        }
    }
}

/// Parameters for one image build. Persisted in the settings file and
/// handed to the pipeline as a read-only value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Database drivers to bake into the image.
    #[serde(default = "default_drivers")]
    pub include_drivers: Vec<String>,

    /// Base image reference for the build manifest.
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Linux distro of the base image.
    #[serde(default = "default_linux_distro")]
    pub linux_distro: String,

    /// Package artifact channel.
    #[serde(default)]
    pub package_source: PackageSource,

    /// Download URL for the package artifact.
    #[serde(default = "default_package_url")]
    pub package_url: String,

    /// Filename of the most recently fetched package artifact.
    #[serde(default)]
    pub package_file: Option<String>,

    /// Substitute the newer worker entry point into the launch script.
    #[serde(default)]
    pub use_modern_worker: bool,

    /// Run the agent process as an unprivileged service user instead of root.
    #[serde(default)]
    pub run_as_agent_user: bool,

    /// Optional suffix appended to the image tag.
    #[serde(default)]
    pub image_name_suffix: Option<String>,

    /// Container network mode ("bridge", "host", or a custom network name).
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Extra host -> address entries injected into the container.
    #[serde(default)]
    pub dns_mappings: std::collections::HashMap<String, String>,

    /// Host path -> container path volume mappings.
    #[serde(default)]
    pub path_mappings: std::collections::HashMap<String, String>,

    /// Build a drivers-only base image, skipping package acquisition.
    #[serde(default)]
    pub drivers_only: bool,
}

/// Which runtime backend executes agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    #[default]
    Docker,
    Kubernetes,
}

/// Runtime backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Backend selected at composition time; exactly one is active.
    #[serde(default)]
    pub backend: RuntimeBackend,

    /// Engine socket path override.
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Namespace for the Kubernetes backend.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Cloud control plane connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Base URL of the control plane.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Site the agents register against.
    #[serde(default)]
    pub site_name: String,

    /// Target pool for launched agents.
    #[serde(default)]
    pub pool_id: Option<String>,

    #[serde(default)]
    pub pool_name: Option<String>,

    /// Owner email recorded on launched agents.
    #[serde(default)]
    pub user_email: Option<String>,
}

/// Background health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Seconds between poll cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Only monitor agents in these pools. Empty means all agents.
    #[serde(default)]
    pub only_pools: Vec<String>,

    /// Routing key for the incident-paging sink.
    #[serde(default)]
    pub pager_routing_key: Option<String>,

    /// Webhook URL for the chat sink.
    #[serde(default)]
    pub chat_webhook_url: Option<String>,
}

/// A stored agent credential. Credentials whose name starts with the admin
/// prefix are used for control-plane queries rather than for agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub name: String,
    pub secret: String,
}

/// Main configuration structure for the bridge manager.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub build: BuildRequest,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Agent credentials, one per agent container.
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,

    /// Image tag selected for run requests, normally set by the last build.
    #[serde(default)]
    pub selected_image: Option<String>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

// Default value functions

fn default_drivers() -> Vec<String> {
    vec!["postgresql".to_string()]
}

fn default_base_image() -> String {
    "registry.access.redhat.com/ubi9/ubi:latest".to_string()
}

fn default_linux_distro() -> String {
    "rhel9".to_string()
}

fn default_package_url() -> String {
    "https://downloads.example.com/packages/BridgeAgent-20242.24.0807.x86_64.rpm".to_string()
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_namespace() -> String {
    "bridge".to_string()
}

fn default_server_url() -> String {
    "https://cloud.example.com".to_string()
}

fn default_check_interval() -> u64 {
    3600
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            include_drivers: default_drivers(),
            base_image: default_base_image(),
            linux_distro: default_linux_distro(),
            package_source: PackageSource::default(),
            package_url: default_package_url(),
            package_file: None,
            use_modern_worker: false,
            run_as_agent_user: false,
            image_name_suffix: None,
            network_mode: default_network_mode(),
            dns_mappings: Default::default(),
            path_mappings: Default::default(),
            drivers_only: false,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::default(),
            docker_socket: None,
            namespace: default_namespace(),
        }
    }
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            site_name: String::new(),
            pool_id: None,
            pool_name: None,
            user_email: None,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            only_pools: Vec::new(),
            pager_routing_key: None,
            chat_webhook_url: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields defaults so a
    /// fresh checkout works without a config step.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let mut settings = Settings::default();
            settings.path = Some(path.to_path_buf());
            return Ok(settings);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let mut settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        settings.path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Save settings back to the file they were loaded from. The file holds
    /// credential secrets, so it is written owner-readable only.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .context("settings were not loaded from a file")?;
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Look up a stored credential by name.
    pub fn credential(&self, name: &str) -> Option<AgentCredential> {
        self.credentials
            .iter()
            .find(|c| c.name == name)
            .map(|c| AgentCredential {
                name: c.name.clone(),
                secret: c.secret.clone(),
            })
    }

    /// The administrative credential used for control-plane queries.
    pub fn admin_credential(&self) -> Option<AgentCredential> {
        self.credentials
            .iter()
            .find(|c| c.name.starts_with(ADMIN_CREDENTIAL_PREFIX))
            .map(|c| AgentCredential {
                name: c.name.clone(),
                secret: c.secret.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.build.linux_distro, "rhel9");
        assert_eq!(settings.runtime.backend, RuntimeBackend::Docker);
        assert_eq!(settings.monitor.check_interval_secs, 3600);
    }

    #[test]
    fn parse_minimal_settings() {
        let toml_content = r#"
            [cloud]
            site_name = "mysite"

            [[credentials]]
            name = "admin-ops"
            secret = "s3cret"

            [[credentials]]
            name = "agent1"
            secret = "t0ken"
        "#;

        let settings: Settings = toml::from_str(toml_content).unwrap();
        assert_eq!(settings.cloud.site_name, "mysite");
        assert_eq!(settings.admin_credential().unwrap().name, "admin-ops");
        assert_eq!(settings.credential("agent1").unwrap().secret, "t0ken");
        assert!(settings.credential("missing").is_none());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.build.network_mode, "bridge");

        settings.save().unwrap();
        assert!(path.exists());
    }
}
