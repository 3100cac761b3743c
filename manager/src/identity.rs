//! Identity scheme
//!
//! Pure functions that derive image tags and container/pod names from build
//! and run parameters, plus the one-way label projections attached to every
//! managed image and container. Identities are deterministic: two settings
//! objects with the same build-relevant fields always map to the same
//! strings, which is what lets the rest of the system look things up by
//! name instead of by opaque engine ids.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::settings::{BuildRequest, PackageSource};

/// Name prefix for all managed containers and pods.
pub const CONTAINER_PREFIX: &str = "bridge_";

/// Image tag prefix for full agent images.
pub const IMAGE_PREFIX: &str = "agent";

/// Image tag prefix for drivers-only base images.
pub const BASE_IMAGE_PREFIX: &str = "agent-base";

/// Label keys attached to managed images and containers. This is the only
/// externally visible schema the manager defines; inspect/list read these
/// back instead of trusting engine-native metadata.
pub mod label_keys {
    pub const AGENT_NAME: &str = "bridge_agent_name";
    pub const SITE_NAME: &str = "bridge_site_name";
    pub const SERVER_URL: &str = "bridge_server_url";
    pub const POOL_NAME: &str = "bridge_pool_name";
    pub const POOL_ID: &str = "bridge_pool_id";
    pub const DATABASE_DRIVERS: &str = "database_drivers";
    pub const PACKAGE_VERSION: &str = "bridge_package_version";
    pub const PACKAGE_SOURCE: &str = "bridge_package_source";
    pub const PACKAGE_DIGEST: &str = "bridge_package_digest";
    pub const BASE_IMAGE_URL: &str = "base_image_url";
    pub const LOGS_PATH: &str = "bridge_logs_path";
    pub const RUN_AS_USER: &str = "run_as_user";
}

/// Derive the package version from an artifact filename, e.g.
/// `BridgeAgent-20242.24.0807.x86_64.rpm` -> `20242.24.0807`.
pub fn version_from_artifact(artifact_file: &str) -> String {
    artifact_file
        .trim_end_matches(".x86_64.rpm")
        .trim_start_matches("bridge-agent-")
        .trim_start_matches("BridgeAgent-")
        .to_string()
}

/// Compose the image tag for a build request: prefix, distro, version and
/// suffix joined by underscores, lower-cased, skipping empty parts.
pub fn image_identity(req: &BuildRequest) -> String {
    let distro = if req.linux_distro.is_empty() {
        "linux".to_string()
    } else {
        req.linux_distro.clone()
    };
    let (prefix, version) = if req.drivers_only {
        (BASE_IMAGE_PREFIX, String::new())
    } else {
        let version = req
            .package_file
            .as_deref()
            .map(version_from_artifact)
            .unwrap_or_default();
        (IMAGE_PREFIX, version)
    };
    let mut name = format!("{}_{}", prefix, distro);
    if !version.is_empty() {
        name.push('_');
        name.push_str(&version);
    }
    if let Some(suffix) = req.image_name_suffix.as_deref() {
        if !suffix.is_empty() {
            name.push('_');
            name.push_str(suffix);
        }
    }
    sanitize_image_tag(&name)
}

/// Compose the container/pod name for an agent. Both parts are required:
/// the site scopes the credential name, which is only unique per site.
pub fn container_identity(site: &str, credential_name: &str) -> Result<String> {
    if site.is_empty() {
        return Err(Error::InvalidArgument("site name is empty".into()));
    }
    if credential_name.is_empty() {
        return Err(Error::InvalidArgument("credential name is empty".into()));
    }
    Ok(format!("{}{}_{}", CONTAINER_PREFIX, site, credential_name))
}

/// Sanitize a string into the engine's tag grammar: lowercase, characters
/// outside `[a-z0-9._-]` replaced by underscores, and a leading `.` or `-`
/// prefixed with an underscore.
pub fn sanitize_image_tag(tag: &str) -> String {
    let mut out: String = tag
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with('.') || out.starts_with('-') {
        out.insert(0, '_');
    }
    out
}

/// Map a container identity onto a DNS-1123 pod name. Underscores are not
/// legal in pod names; the true identity rides in the pod annotations.
pub fn pod_name_for(identity: &str) -> String {
    identity.to_lowercase().replace('_', "-")
}

/// Logs path inside the agent container, determined by which user runs the
/// agent and whether the package is a nightly build (nightlies write to a
/// beta-suffixed repository directory).
pub fn agent_logs_path(source: PackageSource, run_as_agent_user: bool) -> String {
    let home = if run_as_agent_user { "/home/bridge" } else { "/root" };
    let beta = match source {
        PackageSource::Nightly => "_Beta",
        PackageSource::Release => "",
    };
    format!("{}/Documents/Bridge_Repository{}/Logs", home, beta)
}

/// Build-time label projection: provenance recorded on the image.
pub fn labels_for_build(
    req: &BuildRequest,
    artifact_file: &str,
    artifact_digest: Option<&str>,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(
        label_keys::DATABASE_DRIVERS.to_string(),
        req.include_drivers.join(","),
    );
    labels.insert(
        label_keys::PACKAGE_VERSION.to_string(),
        artifact_file.to_string(),
    );
    labels.insert(
        label_keys::PACKAGE_SOURCE.to_string(),
        req.package_source.to_string(),
    );
    labels.insert(label_keys::BASE_IMAGE_URL.to_string(), req.base_image.clone());
    labels.insert(
        label_keys::LOGS_PATH.to_string(),
        agent_logs_path(req.package_source, req.run_as_agent_user),
    );
    if let Some(digest) = artifact_digest {
        labels.insert(label_keys::PACKAGE_DIGEST.to_string(), digest.to_string());
    }
    labels
}

/// Run-time label projection: the full fixed mapping attached to every
/// managed container/pod at creation. Never mutated afterwards.
pub fn labels_for_run(
    req: &BuildRequest,
    agent_name: &str,
    site_name: &str,
    server_url: &str,
    pool_name: Option<&str>,
    pool_id: Option<&str>,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(label_keys::AGENT_NAME.to_string(), agent_name.to_string());
    labels.insert(label_keys::SITE_NAME.to_string(), site_name.to_string());
    labels.insert(label_keys::SERVER_URL.to_string(), server_url.to_string());
    labels.insert(
        label_keys::POOL_NAME.to_string(),
        pool_name.unwrap_or_default().to_string(),
    );
    labels.insert(
        label_keys::POOL_ID.to_string(),
        pool_id.unwrap_or_default().to_string(),
    );
    labels.insert(
        label_keys::DATABASE_DRIVERS.to_string(),
        req.include_drivers.join(","),
    );
    labels.insert(
        label_keys::PACKAGE_VERSION.to_string(),
        req.package_file.clone().unwrap_or_default(),
    );
    labels.insert(
        label_keys::PACKAGE_SOURCE.to_string(),
        req.package_source.to_string(),
    );
    labels.insert(label_keys::BASE_IMAGE_URL.to_string(), req.base_image.clone());
    labels.insert(
        label_keys::LOGS_PATH.to_string(),
        agent_logs_path(req.package_source, req.run_as_agent_user),
    );
    labels.insert(
        label_keys::RUN_AS_USER.to_string(),
        if req.run_as_agent_user { "bridge" } else { "root" }.to_string(),
    );
    labels
}
