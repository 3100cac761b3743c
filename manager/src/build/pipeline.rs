//! Build pipeline
//!
//! One invocation produces one tagged, labeled image. The engine is probed
//! before anything touches the filesystem, the package artifact is fetched
//! (or reused) into the scratch build directory, templates are rendered by
//! marker substitution, and the engine build runs with caching disabled.
//! A drivers-only request skips package acquisition and selects the
//! alternate manifest; every other step is shared.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::build::artifact::{file_digest, ArtifactStore};
use crate::build::template;
use crate::error::{Error, Result};
use crate::identity::{image_identity, labels_for_build};
use crate::runtime::docker::DockerAdapter;
use crate::settings::BuildRequest;

/// Engine-side surface the pipeline needs. Split from the full runtime
/// capability set so tests can substitute a recording engine.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Reachability probe; must fail before any build work starts.
    async fn ping(&self) -> Result<()>;

    /// Run the engine build over a rendered context directory and return
    /// the build log lines.
    async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        build_args: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<String>>;
}

#[async_trait]
impl BuildEngine for DockerAdapter {
    async fn ping(&self) -> Result<()> {
        crate::runtime::RuntimeAdapter::ping(self).await
    }

    async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        build_args: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<String>> {
        DockerAdapter::build_image(self, tag, context_dir, build_args, labels).await
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The tagged image identity.
    pub image: String,
    /// Engine build log lines.
    pub log: Vec<String>,
    /// Artifact the image was built from, for the caller to persist so the
    /// next build derives the same identity. `None` for drivers-only builds.
    pub package_file: Option<String>,
}

/// The image build pipeline. Stateless per call apart from the scratch
/// build directory it reuses between builds.
pub struct ImageBuilder {
    engine: Arc<dyn BuildEngine>,
    store: Arc<dyn ArtifactStore>,
    build_dir: PathBuf,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn BuildEngine>, store: Arc<dyn ArtifactStore>, build_dir: &Path) -> Self {
        Self {
            engine,
            store,
            build_dir: build_dir.to_path_buf(),
        }
    }

    /// Build one image for the request. `refresh_artifact` forces the
    /// package artifact to be re-fetched even when already present.
    pub async fn build(&self, req: &BuildRequest, refresh_artifact: bool) -> Result<BuildOutcome> {
        info!("building bridge agent image");

        // Pre-flight: an unreachable engine must abort before any
        // filesystem mutation.
        self.engine.ping().await?;

        std::fs::create_dir_all(self.build_dir.join("drivers"))?;
        info!(dir = %self.build_dir.display(), "build directory ready");

        let mut req = req.clone();
        let (artifact_file, artifact_digest) = if req.drivers_only {
            ("n/a, drivers only".to_string(), None)
        } else {
            if refresh_artifact {
                info!("forcing re-fetch of package artifact");
            }
            let path = self
                .store
                .fetch(refresh_artifact)
                .await?
                .ok_or_else(|| {
                    Error::ArtifactNotFound(format!(
                        "no package artifact in {}",
                        self.build_dir.display()
                    ))
                })?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::ArtifactNotFound(path.display().to_string()))?
                .to_string();
            info!(artifact = %name, "using package artifact");
            let digest = file_digest(&path)?;
            req.package_file = Some(name.clone());
            (name, Some(digest))
        };

        // Render the launch script and manifest into the context.
        let script = template::render_launch_script(req.use_modern_worker);
        template::write_rendered(
            &self.build_dir.join(template::LAUNCH_SCRIPT_NAME),
            &script,
            true,
        )?;

        let config_present = self.build_dir.join(template::CLIENT_CONFIG_FILENAME).exists();
        if config_present {
            info!(file = template::CLIENT_CONFIG_FILENAME, "including custom client configuration");
        }
        let manifest = template::render_manifest(&req, config_present);
        template::write_rendered(
            &self.build_dir.join(template::MANIFEST_NAME),
            &manifest,
            false,
        )?;

        let labels = labels_for_build(&req, &artifact_file, artifact_digest.as_deref());
        let mut build_args = HashMap::new();
        if !req.drivers_only {
            build_args.insert("AGENT_PACKAGE".to_string(), artifact_file.clone());
        }

        let image = image_identity(&req);
        info!(image = %image, "starting engine build, this can take a few minutes");
        let log = self
            .engine
            .build_image(&image, &self.build_dir, &build_args, &labels)
            .await?;

        Ok(BuildOutcome {
            image,
            log,
            package_file: if req.drivers_only { None } else { req.package_file },
        })
    }

    /// Scratch directory the pipeline renders into and fetches artifacts to.
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StubEngine {
        reachable: bool,
        fail_build: bool,
        tagged: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BuildEngine for StubEngine {
        async fn ping(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(Error::EngineUnavailable("engine is down".into()))
            }
        }

        async fn build_image(
            &self,
            tag: &str,
            _context_dir: &Path,
            _build_args: &HashMap<String, String>,
            _labels: &HashMap<String, String>,
        ) -> Result<Vec<String>> {
            if self.fail_build {
                return Err(Error::BuildFailed {
                    log: vec!["step 3 failed".to_string()],
                });
            }
            self.tagged.lock().push(tag.to_string());
            Ok(vec!["step 1".to_string(), "step 2".to_string()])
        }
    }

    struct StubStore {
        artifact: Option<PathBuf>,
    }

    #[async_trait]
    impl ArtifactStore for StubStore {
        async fn fetch(&self, _force_refresh: bool) -> Result<Option<PathBuf>> {
            Ok(self.artifact.clone())
        }
    }

    fn request() -> BuildRequest {
        BuildRequest {
            linux_distro: "rhel9".to_string(),
            ..BuildRequest::default()
        }
    }

    #[tokio::test]
    async fn unreachable_engine_aborts_before_any_filesystem_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("buildimg");
        let builder = ImageBuilder::new(
            Arc::new(StubEngine { reachable: false, ..Default::default() }),
            Arc::new(StubStore { artifact: None }),
            &build_dir,
        );
        let err = builder.build(&request(), false).await.unwrap_err();
        assert!(matches!(err, Error::EngineUnavailable(_)));
        assert!(!build_dir.exists());
    }

    #[tokio::test]
    async fn missing_artifact_fails_with_artifact_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ImageBuilder::new(
            Arc::new(StubEngine { reachable: true, ..Default::default() }),
            Arc::new(StubStore { artifact: None }),
            dir.path(),
        );
        let err = builder.build(&request(), false).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
    }

    #[tokio::test]
    async fn successful_build_tags_the_computed_identity() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("BridgeAgent-20242.24.0807.x86_64.rpm");
        std::fs::write(&artifact, b"rpm-bytes").unwrap();

        let engine = Arc::new(StubEngine { reachable: true, ..Default::default() });
        let builder = ImageBuilder::new(
            engine.clone(),
            Arc::new(StubStore { artifact: Some(artifact) }),
            dir.path(),
        );
        let outcome = builder.build(&request(), false).await.unwrap();
        assert_eq!(outcome.image, "agent_rhel9_20242.24.0807");
        assert_eq!(engine.tagged.lock().as_slice(), ["agent_rhel9_20242.24.0807"]);
        assert!(!outcome.log.is_empty());
        // Rendered context landed in the build directory.
        assert!(dir.path().join(template::MANIFEST_NAME).exists());
        assert!(dir.path().join(template::LAUNCH_SCRIPT_NAME).exists());
    }

    #[tokio::test]
    async fn failed_build_leaves_no_taggable_image() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("BridgeAgent-20242.24.0807.x86_64.rpm");
        std::fs::write(&artifact, b"rpm-bytes").unwrap();

        let engine = Arc::new(StubEngine {
            reachable: true,
            fail_build: true,
            ..Default::default()
        });
        let builder = ImageBuilder::new(
            engine.clone(),
            Arc::new(StubStore { artifact: Some(artifact) }),
            dir.path(),
        );
        let err = builder.build(&request(), false).await.unwrap_err();
        match err {
            Error::BuildFailed { log } => assert!(!log.is_empty()),
            other => panic!("expected BuildFailed, got {other:?}"),
        }
        assert!(engine.tagged.lock().is_empty());
    }

    #[tokio::test]
    async fn drivers_only_build_skips_artifact_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(StubEngine { reachable: true, ..Default::default() });
        let mut req = request();
        req.drivers_only = true;

        // No artifact is available; the drivers-only variant must not care.
        let builder = ImageBuilder::new(
            engine.clone(),
            Arc::new(StubStore { artifact: None }),
            dir.path(),
        );
        let outcome = builder.build(&req, false).await.unwrap();
        assert_eq!(outcome.image, "agent-base_rhel9");
    }
}
