//! Cloud control plane
//!
//! Types and client for the cloud side of the system: agent credentials,
//! per-agent connection reports, and the REST client that produces them.
//! The control plane is a read-only data source here; the manager does not
//! own agent registration or pool assignment.

pub mod client;

pub use client::{CloudSession, CloudStatusSource};

use async_trait::async_trait;

use crate::error::Result;

/// Credentials whose name starts with this prefix carry site-administrator
/// rights and are used for control-plane queries.
pub const ADMIN_CREDENTIAL_PREFIX: &str = "admin-";

/// Connection status value the control plane reports for a healthy agent.
pub const STATUS_CONNECTED: &str = "CONNECTED";

/// A personal access credential for one agent (or, with the admin prefix,
/// for control-plane queries).
#[derive(Debug, Clone)]
pub struct AgentCredential {
    pub name: String,
    pub secret: String,
}

/// One agent's connection status as seen by the control plane. Produced
/// fresh each poll cycle and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReport {
    pub agent_name: String,
    pub pool_name: String,
    pub status: String,
}

impl AgentReport {
    pub fn is_connected(&self) -> bool {
        self.status == STATUS_CONNECTED
    }
}

/// Everything one poll cycle needs from the control plane.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub site_name: String,
    pub reports: Vec<AgentReport>,
}

/// Source of agent connection snapshots. The production implementation
/// signs in to the control plane per call; tests substitute canned data.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, credential: &AgentCredential) -> Result<StatusSnapshot>;
}

/// Supplies the administrative credential for monitor poll cycles. Absence
/// is a normal condition the monitor logs and skips over.
pub trait AdminCredentialProvider: Send + Sync {
    fn admin_credential(&self) -> Option<AgentCredential>;
}

/// Provider over a credential resolved once at composition time.
pub struct StaticCredentialProvider {
    credential: Option<AgentCredential>,
}

impl StaticCredentialProvider {
    pub fn new(credential: Option<AgentCredential>) -> Self {
        Self { credential }
    }
}

impl AdminCredentialProvider for StaticCredentialProvider {
    fn admin_credential(&self) -> Option<AgentCredential> {
        self.credential.clone()
    }
}
