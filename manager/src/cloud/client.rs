//! Control plane REST client
//!
//! Thin client over the cloud control plane's session and status APIs. A
//! session token is acquired per call sequence and released afterwards; no
//! session state is cached between calls.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::cloud::{
    AgentCredential, AgentReport, StatusSnapshot, StatusSource, STATUS_CONNECTED,
};
use crate::error::{Error, Result};

const API_VERSION: &str = "3.22";

/// Pool name shown for agents in the site default pool.
pub const DEFAULT_POOL: &str = "(default)";

/// Pool name shown for agents not assigned to any pool.
pub const UNASSIGNED_POOL: &str = "(unassigned)";

/// An authenticated control-plane session. Dropping the session without
/// calling [`CloudSession::sign_out`] leaves the token to expire server-side.
#[derive(Debug)]
pub struct CloudSession {
    http: reqwest::Client,
    server_url: String,
    token: String,
    site_luid: String,
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    credentials: SignInCredentials,
}

#[derive(Debug, Deserialize)]
struct SignInCredentials {
    token: String,
    site: SignInSite,
}

#[derive(Debug, Deserialize)]
struct SignInSite {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    result: StatusResult,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    agents: Vec<AgentConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentConnection {
    agent_name: String,
    connection_status: String,
}

#[derive(Debug, Deserialize)]
struct PoolsResponse {
    result: PoolsResult,
}

#[derive(Debug, Deserialize)]
struct PoolsResult {
    success: PoolsSuccess,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PoolsSuccess {
    user_defined_pools: HashMap<String, PoolEntry>,
    default_pool_agents: HashMap<String, PoolAgent>,
    unassigned_agents: HashMap<String, PoolAgent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolEntry {
    display_name: String,
    #[serde(default)]
    agents: HashMap<String, PoolAgent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolAgent {
    agent_name: String,
}

impl CloudSession {
    /// Sign in with a personal access credential and return an
    /// authenticated session.
    pub async fn sign_in(
        server_url: &str,
        site_name: &str,
        credential: &AgentCredential,
    ) -> Result<Self> {
        if credential.name.is_empty() || credential.secret.is_empty() {
            return Err(Error::InvalidArgument("credential name or secret is empty".into()));
        }
        let http = reqwest::Client::new();
        let body = json!({
            "credentials": {
                "personalAccessTokenName": credential.name,
                "personalAccessTokenSecret": credential.secret,
                "site": { "contentUrl": site_name }
            }
        });
        let response = http
            .post(format!("{}/api/{}/auth/signin", server_url, API_VERSION))
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "sign-in failed for credential '{}': {}",
                credential.name,
                response.status()
            )));
        }
        let signin: SignInResponse = response.json().await?;
        Ok(Self {
            http,
            server_url: server_url.to_string(),
            token: signin.credentials.token,
            site_luid: signin.credentials.site.id,
        })
    }

    /// Release the session token. Failures are logged, not surfaced: the
    /// token expires server-side regardless.
    pub async fn sign_out(self) {
        let result = self
            .http
            .post(format!("{}/api/{}/auth/signout", self.server_url, API_VERSION))
            .header("accept", "application/json")
            .header("X-Auth-Session", &self.token)
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to sign out of control plane session");
        }
    }

    async fn post_internal<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = json!({ "method": method, "params": params });
        let response = self
            .http
            .post(format!("{}/api/internal/{}", self.server_url, method))
            .header("X-Auth-Session", &self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Per-agent connection status keyed by agent name.
    pub async fn agent_connection_status(&self) -> Result<HashMap<String, String>> {
        let response: StatusResponse = self
            .post_internal("getAgentConnectionStatus", json!({}))
            .await?;
        Ok(response
            .result
            .agents
            .into_iter()
            .map(|a| (a.agent_name, a.connection_status))
            .collect())
    }

    /// Agents grouped into pools: user-defined pools by display name, plus
    /// the default-pool and unassigned groups.
    pub async fn pool_membership(&self) -> Result<Vec<(String, String)>> {
        let response: PoolsResponse = self
            .post_internal("getAgentPools", json!({ "siteId": self.site_luid }))
            .await?;
        let success = response.result.success;
        let mut membership = Vec::new();
        for pool in success.user_defined_pools.into_values() {
            for agent in pool.agents.into_values() {
                membership.push((agent.agent_name, pool.display_name.clone()));
            }
        }
        for agent in success.default_pool_agents.into_values() {
            membership.push((agent.agent_name, DEFAULT_POOL.to_string()));
        }
        for agent in success.unassigned_agents.into_values() {
            membership.push((agent.agent_name, UNASSIGNED_POOL.to_string()));
        }
        Ok(membership)
    }

    /// Join connection status with pool membership into per-agent reports.
    pub async fn agent_reports(&self) -> Result<Vec<AgentReport>> {
        let status = self.agent_connection_status().await?;
        let membership = self.pool_membership().await?;
        let mut reports: Vec<AgentReport> = membership
            .into_iter()
            .map(|(agent_name, pool_name)| {
                let status = status
                    .get(&agent_name)
                    .cloned()
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                AgentReport { agent_name, pool_name, status }
            })
            .collect();
        reports.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        Ok(reports)
    }
}

/// Status source backed by the control plane: signs in with the supplied
/// credential, collects reports, and releases the session.
pub struct CloudStatusSource {
    server_url: String,
    site_name: String,
}

impl CloudStatusSource {
    pub fn new(server_url: &str, site_name: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            site_name: site_name.to_string(),
        }
    }
}

#[async_trait]
impl StatusSource for CloudStatusSource {
    async fn fetch(&self, credential: &AgentCredential) -> Result<StatusSnapshot> {
        let session = CloudSession::sign_in(&self.server_url, &self.site_name, credential).await?;
        let reports = session.agent_reports().await;
        session.sign_out().await;
        Ok(StatusSnapshot {
            site_name: self.site_name.clone(),
            reports: reports?,
        })
    }
}

/// Render reports as aligned text lines for the status command.
pub fn format_reports(reports: &[AgentReport]) -> Vec<String> {
    reports
        .iter()
        .map(|r| {
            let marker = if r.status == STATUS_CONNECTED { " " } else { "!" };
            format!("{} {:<32} {:<20} {}", marker, r.agent_name, r.pool_name, r.status)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_in_and_assemble_reports() {
        let mut server = mockito::Server::new_async().await;
        let _signin = server
            .mock("POST", "/api/3.22/auth/signin")
            .with_status(200)
            .with_body(
                r#"{"credentials": {"token": "tok-1", "site": {"id": "site-luid"}, "user": {"id": "u1"}}}"#,
            )
            .create_async()
            .await;
        let _status = server
            .mock("POST", "/api/internal/getAgentConnectionStatus")
            .with_status(200)
            .with_body(
                r#"{"result": {"agents": [
                    {"agentName": "agent1", "connectionStatus": "CONNECTED"},
                    {"agentName": "agent2", "connectionStatus": "DISCONNECTED"}
                ]}}"#,
            )
            .create_async()
            .await;
        let _pools = server
            .mock("POST", "/api/internal/getAgentPools")
            .with_status(200)
            .with_body(
                r#"{"result": {"success": {
                    "userDefinedPools": {
                        "p1": {"displayName": "poolA", "agents": {"a": {"agentName": "agent1"}}}
                    },
                    "defaultPoolAgents": {"b": {"agentName": "agent2"}},
                    "unassignedAgents": {}
                }}}"#,
            )
            .create_async()
            .await;

        let credential = AgentCredential {
            name: "admin-ops".to_string(),
            secret: "s".to_string(),
        };
        let session = CloudSession::sign_in(&server.url(), "mysite", &credential)
            .await
            .unwrap();
        let reports = session.agent_reports().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].agent_name, "agent1");
        assert_eq!(reports[0].pool_name, "poolA");
        assert!(reports[0].is_connected());
        assert_eq!(reports[1].pool_name, DEFAULT_POOL);
        assert_eq!(reports[1].status, "DISCONNECTED");
    }

    #[tokio::test]
    async fn sign_in_rejects_empty_credentials() {
        let credential = AgentCredential {
            name: String::new(),
            secret: "s".to_string(),
        };
        let err = CloudSession::sign_in("http://localhost:1", "site", &credential)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
