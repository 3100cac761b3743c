//! Build context rendering
//!
//! The launch script and build manifests ship with the crate and contain
//! literal placeholder markers. Rendering is plain text substitution: each
//! marker is replaced once, markers are disjoint so order does not matter,
//! and conditional sections (user creation, custom config copy) are decided
//! here by substituting either content or a skip comment — never by runtime
//! branching inside the rendered manifest.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::settings::{BuildRequest, PackageSource};

pub const MARKER_FROM_BASEIMAGE: &str = "#<FROM_BASEIMAGE>";
pub const MARKER_USER_CREATE: &str = "#<USER_CREATE>";
pub const MARKER_USER_SET: &str = "#<USER_SET>";
pub const MARKER_COPY_DRIVER_FILES: &str = "#<COPY_DRIVER_FILES>";
pub const MARKER_COPY_CLIENT_CONFIG: &str = "#<COPY_CLIENT_CONFIG>";

/// Worker binary the launch script starts; the modern-worker flag swaps in
/// the wrapper script instead.
pub const CLASSIC_WORKER: &str = "bridge-client-worker";
pub const MODERN_WORKER: &str = "run-agent.sh";

/// Name of the optional custom client configuration file. When present in
/// the build directory it is copied into the image.
pub const CLIENT_CONFIG_FILENAME: &str = "BridgeClientConfiguration.json";

pub const LAUNCH_SCRIPT_NAME: &str = "launch-agent.sh";
pub const MANIFEST_NAME: &str = "Containerfile";

const LAUNCH_SCRIPT_TEMPLATE: &str = include_str!("../../templates/launch-agent.sh");
const MANIFEST_TEMPLATE: &str = include_str!("../../templates/Containerfile.tmpl");
const DRIVERS_MANIFEST_TEMPLATE: &str = include_str!("../../templates/Containerfile.drivers.tmpl");

/// Replace each marker with its literal replacement text.
pub fn render(template: &str, replacements: &HashMap<&str, String>) -> String {
    let mut content = template.to_string();
    for (marker, replacement) in replacements {
        content = content.replace(marker, replacement);
    }
    content
}

/// One COPY line per driver setup file staged under `drivers/`.
pub fn driver_copy_lines(drivers: &[String]) -> String {
    drivers
        .iter()
        .map(|d| format!("COPY ./drivers/{}.sh /tmp/drivers/", d))
        .collect::<Vec<_>>()
        .join("\n")
}

fn user_create_block(run_as_agent_user: bool) -> String {
    if run_as_agent_user {
        r#"RUN groupadd --system --gid 1053 bridge && \
    adduser --system --gid 1053 --uid 1053 --shell /bin/bash --home /home/bridge bridge && \
    mkdir -p /home/bridge /bridge_setup && \
    chown -R bridge:bridge /home/bridge /bridge_setup
"#
        .to_string()
    } else {
        String::new()
    }
}

fn user_set_block(run_as_agent_user: bool) -> String {
    if run_as_agent_user {
        "USER bridge".to_string()
    } else {
        "USER root".to_string()
    }
}

fn client_config_copy(req: &BuildRequest, config_present: bool) -> String {
    if !config_present {
        return "# skip custom client configuration".to_string();
    }
    let home = if req.run_as_agent_user { "/home/bridge" } else { "/root" };
    let beta = match req.package_source {
        PackageSource::Nightly => "_Beta",
        PackageSource::Release => "",
    };
    format!(
        "COPY {} {}/Documents/Bridge_Repository{}/Configuration/{}",
        CLIENT_CONFIG_FILENAME, home, beta, CLIENT_CONFIG_FILENAME
    )
}

/// Render the build manifest for a request. `config_present` says whether a
/// custom client config sits in the build directory.
pub fn render_manifest(req: &BuildRequest, config_present: bool) -> String {
    let template = if req.drivers_only {
        DRIVERS_MANIFEST_TEMPLATE
    } else {
        MANIFEST_TEMPLATE
    };
    let replacements = HashMap::from([
        (MARKER_FROM_BASEIMAGE, req.base_image.clone()),
        (MARKER_USER_CREATE, user_create_block(req.run_as_agent_user)),
        (MARKER_USER_SET, user_set_block(req.run_as_agent_user)),
        (MARKER_COPY_DRIVER_FILES, driver_copy_lines(&req.include_drivers)),
        (MARKER_COPY_CLIENT_CONFIG, client_config_copy(req, config_present)),
    ]);
    render(template, &replacements)
}

/// Render the launch script, swapping in the modern worker entry point when
/// requested.
pub fn render_launch_script(use_modern_worker: bool) -> String {
    if use_modern_worker {
        LAUNCH_SCRIPT_TEMPLATE.replace(CLASSIC_WORKER, MODERN_WORKER)
    } else {
        LAUNCH_SCRIPT_TEMPLATE.to_string()
    }
}

/// Write rendered content with Unix line endings, optionally executable.
pub fn write_rendered(dest: &Path, content: &str, executable: bool) -> Result<()> {
    let content = content.replace("\r\n", "\n");
    std::fs::write(dest, content)?;
    if executable {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(dest)?.permissions();
            perms.set_mode(perms.mode() | 0o111);
            std::fs::set_permissions(dest, perms)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_disjoint_markers() {
        let replacements = HashMap::from([
            ("#<A>", "one".to_string()),
            ("#<B>", "two".to_string()),
        ]);
        assert_eq!(render("#<A> and #<B>", &replacements), "one and two");
    }

    #[test]
    fn manifest_substitutes_base_image_and_drivers() {
        let req = BuildRequest {
            base_image: "registry.example.com/ubi9:latest".to_string(),
            include_drivers: vec!["postgresql".to_string(), "mysql".to_string()],
            ..BuildRequest::default()
        };
        let manifest = render_manifest(&req, false);
        assert!(manifest.contains("FROM registry.example.com/ubi9:latest"));
        assert!(manifest.contains("COPY ./drivers/postgresql.sh /tmp/drivers/"));
        assert!(manifest.contains("COPY ./drivers/mysql.sh /tmp/drivers/"));
        assert!(manifest.contains("# skip custom client configuration"));
        assert!(!manifest.contains("#<"));
    }

    #[test]
    fn user_blocks_resolve_by_presence() {
        let mut req = BuildRequest::default();
        req.run_as_agent_user = true;
        let manifest = render_manifest(&req, false);
        assert!(manifest.contains("groupadd --system --gid 1053 bridge"));
        assert!(manifest.contains("USER bridge"));

        req.run_as_agent_user = false;
        let manifest = render_manifest(&req, false);
        assert!(!manifest.contains("groupadd"));
        assert!(manifest.contains("USER root"));
    }

    #[test]
    fn client_config_copy_lands_in_the_right_home() {
        let mut req = BuildRequest::default();
        req.run_as_agent_user = true;
        req.package_source = PackageSource::Nightly;
        let manifest = render_manifest(&req, true);
        assert!(manifest.contains(
            "COPY BridgeClientConfiguration.json /home/bridge/Documents/Bridge_Repository_Beta/Configuration/BridgeClientConfiguration.json"
        ));
    }

    #[test]
    fn drivers_only_selects_the_alternate_manifest() {
        let mut req = BuildRequest::default();
        req.drivers_only = true;
        let manifest = render_manifest(&req, false);
        assert!(!manifest.contains("AGENT_PACKAGE"));
        assert!(manifest.contains("FROM "));
    }

    #[test]
    fn modern_worker_swaps_the_entry_point() {
        let classic = render_launch_script(false);
        assert!(classic.contains(CLASSIC_WORKER));

        let modern = render_launch_script(true);
        assert!(!modern.contains(CLASSIC_WORKER));
        assert!(modern.contains(MODERN_WORKER));
    }

    #[test]
    fn write_rendered_normalizes_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("script.sh");
        write_rendered(&dest, "a\r\nb\r\n", true).unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "a\nb\n");
    }
}
