//! Agent Launcher
//!
//! Turns a run request (selected image + agent credential + settings) into
//! a LaunchSpec and starts it on whichever runtime backend the composition
//! root selected. One container per credential; the credential name becomes
//! the agent name.

use std::sync::Arc;
use tracing::info;

use crate::cloud::AgentCredential;
use crate::error::{Error, Result};
use crate::identity::{container_identity, labels_for_run};
use crate::runtime::{LaunchSpec, RuntimeAdapter, VolumeBinding};
use crate::settings::Settings;

/// Launcher over a runtime backend.
pub struct AgentLauncher {
    runtime: Arc<dyn RuntimeAdapter>,
}

impl AgentLauncher {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self { runtime }
    }

    /// Compose the launch spec for one agent without starting it.
    pub fn compose(
        &self,
        settings: &Settings,
        credential: &AgentCredential,
        image: &str,
    ) -> Result<LaunchSpec> {
        if credential.secret.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "credential '{}' has an empty secret",
                credential.name
            )));
        }
        if image.is_empty() {
            return Err(Error::InvalidArgument("no image selected".into()));
        }
        let identity = container_identity(&settings.cloud.site_name, &credential.name)?;

        let labels = labels_for_run(
            &settings.build,
            &credential.name,
            &settings.cloud.site_name,
            &settings.cloud.server_url,
            settings.cloud.pool_name.as_deref(),
            settings.cloud.pool_id.as_deref(),
        );

        let env = vec![
            ("AGENT_NAME".to_string(), credential.name.clone()),
            ("TOKEN_ID".to_string(), credential.name.clone()),
            ("TOKEN_VALUE".to_string(), credential.secret.clone()),
            ("SITE_NAME".to_string(), settings.cloud.site_name.clone()),
            ("SERVER_URL".to_string(), settings.cloud.server_url.clone()),
            (
                "POOL_ID".to_string(),
                settings.cloud.pool_id.clone().unwrap_or_default(),
            ),
            (
                "USER_EMAIL".to_string(),
                settings.cloud.user_email.clone().unwrap_or_default(),
            ),
        ];

        let volumes = settings
            .build
            .path_mappings
            .iter()
            .map(|(host, container)| VolumeBinding {
                source: host.clone(),
                target: container.clone(),
                read_only: false,
            })
            .collect();

        Ok(LaunchSpec {
            identity,
            image: image.to_string(),
            labels,
            env,
            volumes,
            dns_mappings: settings.build.dns_mappings.clone(),
            network_mode: Some(settings.build.network_mode.clone()),
        })
    }

    /// Compose and start one agent container. Fails with `AlreadyRunning`
    /// when an agent for this (site, credential) pair exists.
    pub async fn launch(
        &self,
        settings: &Settings,
        credential: &AgentCredential,
        image: &str,
    ) -> Result<String> {
        let spec = self.compose(settings, credential, image)?;
        info!(
            identity = %spec.identity,
            image = %image,
            backend = self.runtime.runtime_type(),
            "launching bridge agent"
        );
        let id = self.runtime.create(&spec).await?;
        info!(identity = %spec.identity, "bridge agent started");
        Ok(id)
    }
}
