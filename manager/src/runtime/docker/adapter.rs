//! Docker Adapter
//!
//! Implementation of RuntimeAdapter for a local Docker-compatible engine
//! using the bollard library. Containers are addressed by identity name,
//! never by engine id, and list queries are filtered to the managed prefix.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions as EngineCreateOptions, DownloadFromContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::{CONTAINER_PREFIX, BASE_IMAGE_PREFIX, IMAGE_PREFIX};
use crate::runtime::adapter::{
    AgentContainer, ContainerStatus, ExecOutput, LaunchSpec, ResourceUsage, RuntimeAdapter,
    StopOutcome,
};

const AMD64_PLATFORM: &str = "linux/amd64";

/// Image metadata read back from the engine, with provenance labels.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub size_gb: f64,
    pub created: Option<String>,
}

/// Docker runtime adapter.
pub struct DockerAdapter {
    client: Docker,
}

impl DockerAdapter {
    /// Connect to the default engine socket.
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_socket_defaults()?;
        Ok(Self { client })
    }

    /// Connect to an explicit socket path.
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { client })
    }

    fn parse_status(state: Option<&str>) -> ContainerStatus {
        match state {
            Some("created") => ContainerStatus::Created,
            Some("running") => ContainerStatus::Running,
            Some("restarting") => ContainerStatus::Restarting,
            Some("exited") => ContainerStatus::Exited,
            Some("dead") => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    fn is_not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
        )
    }

    /// CPU usage percent from a one-shot stats delta.
    fn calc_cpu_pct(stats: &bollard::container::Stats) -> f64 {
        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        if system_delta > 0.0 {
            (cpu_delta / system_delta) * stats.cpu_stats.online_cpus.unwrap_or(1) as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Build an image from a rendered context directory. The directory is
    /// archived and shipped to the engine; `no-cache` is always on so a
    /// rebuild never reuses layers from a different request. Returns the
    /// engine's build log lines; a failed build maps to `BuildFailed` and
    /// leaves no tag behind.
    pub async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        build_args: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<String>> {
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", context_dir)?;
        let context = archive.into_inner()?;

        let options = BuildImageOptions::<String> {
            dockerfile: "Containerfile".to_string(),
            t: tag.to_string(),
            nocache: true,
            rm: true,
            buildargs: build_args.clone(),
            labels: labels.clone(),
            platform: AMD64_PLATFORM.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(context.into()));
        let mut log = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            log.push(line.to_string());
                        }
                    }
                    if let Some(error) = info.error {
                        log.push(error);
                        return Err(Error::BuildFailed { log });
                    }
                }
                Err(e) => {
                    log.push(e.to_string());
                    return Err(Error::BuildFailed { log });
                }
            }
        }
        info!(tag = %tag, "image built");
        Ok(log)
    }

    /// Inspect an image by tag. `Ok(None)` when the tag does not exist.
    pub async fn image_details(&self, image_name: &str) -> Result<Option<ImageDetails>> {
        match self.client.inspect_image(image_name).await {
            Ok(image) => Ok(Some(ImageDetails {
                id: image.id.unwrap_or_default(),
                labels: image
                    .config
                    .and_then(|c| c.labels)
                    .unwrap_or_default(),
                size_gb: image.size.unwrap_or(0) as f64 / (1024u64.pow(3) as f64),
                created: image.created,
            })),
            Err(e) if Self::is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn image_exists(&self, image_name: &str) -> Result<bool> {
        Ok(self.image_details(image_name).await?.is_some())
    }

    pub async fn remove_image(&self, image_name: &str) -> Result<bool> {
        match self
            .client
            .remove_image(image_name, None::<RemoveImageOptions>, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if Self::is_not_found(&e) => {
                warn!(image = %image_name, "image not found during removal");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tags of locally present agent images, for run-request selection.
    pub async fn list_agent_images(&self) -> Result<Vec<String>> {
        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await?;
        let mut tags: Vec<String> = images
            .into_iter()
            .flat_map(|img| img.repo_tags)
            .filter(|t| {
                t.starts_with(&format!("{}_", IMAGE_PREFIX))
                    || t.starts_with(&format!("{}_", BASE_IMAGE_PREFIX))
            })
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Restart a container in place, e.g. after a config mutation.
    pub async fn restart(&self, identity: &str) -> Result<()> {
        self.client
            .restart_container(identity, None::<RestartContainerOptions>)
            .await?;
        info!(container = %identity, "container restarted");
        Ok(())
    }

    fn summary_to_container(summary: bollard::models::ContainerSummary) -> AgentContainer {
        let name = summary
            .names
            .and_then(|n| n.first().cloned())
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        AgentContainer {
            identity: name,
            image: summary.image,
            status: Self::parse_status(summary.state.as_deref()),
            started_at: None,
            labels: summary.labels.unwrap_or_default(),
            volume_mounts: summary
                .mounts
                .unwrap_or_default()
                .into_iter()
                .filter_map(|m| match (m.source, m.destination) {
                    (Some(src), Some(dst)) => Some(format!("{} => {}", src, dst)),
                    _ => None,
                })
                .collect(),
            network_mode: summary.host_config.and_then(|h| h.network_mode),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    fn runtime_type(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<String> {
        if self.inspect(&spec.identity).await?.is_some() {
            return Err(Error::AlreadyRunning(spec.identity.clone()));
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                if v.read_only {
                    format!("{}:{}:ro", v.source, v.target)
                } else {
                    format!("{}:{}", v.source, v.target)
                }
            })
            .collect();

        let extra_hosts: Vec<String> = spec
            .dns_mappings
            .iter()
            .map(|(host, addr)| format!("{}:{}", host, addr))
            .collect();

        // Restart on failure with a capped retry count: a crashing agent
        // neither spins forever nor silently stays down.
        let host_config = bollard::service::HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            extra_hosts: if extra_hosts.is_empty() { None } else { Some(extra_hosts) },
            network_mode: spec.network_mode.clone(),
            restart_policy: Some(bollard::service::RestartPolicy {
                name: Some(bollard::service::RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(1),
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = EngineCreateOptions {
            name: spec.identity.as_str(),
            platform: None,
        };

        let response = match self.client.create_container(Some(create_options), config).await {
            Ok(response) => response,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => return Err(Error::AlreadyRunning(spec.identity.clone())),
            Err(e) => return Err(e.into()),
        };

        self.client
            .start_container(&spec.identity, None::<StartContainerOptions<String>>)
            .await?;
        info!(container = %spec.identity, id = %response.id, "container started");
        Ok(response.id)
    }

    async fn list(&self) -> Result<Vec<AgentContainer>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![CONTAINER_PREFIX.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await?;

        // The engine name filter is a substring match; key by identity so a
        // create racing this list can never surface twice.
        let mut by_identity = BTreeMap::new();
        for summary in containers {
            let container = Self::summary_to_container(summary);
            if crate::runtime::adapter::is_managed_name(&container.identity) {
                by_identity.insert(container.identity.clone(), container);
            }
        }
        Ok(by_identity.into_values().collect())
    }

    async fn inspect(&self, identity: &str) -> Result<Option<AgentContainer>> {
        match self.client.inspect_container(identity, None).await {
            Ok(inspected) => {
                let state = inspected.state.as_ref();
                let status = state.and_then(|s| s.status.as_ref()).map(|s| match s {
                    bollard::service::ContainerStateStatusEnum::CREATED => "created",
                    bollard::service::ContainerStateStatusEnum::RUNNING => "running",
                    bollard::service::ContainerStateStatusEnum::RESTARTING => "restarting",
                    bollard::service::ContainerStateStatusEnum::EXITED => "exited",
                    bollard::service::ContainerStateStatusEnum::DEAD => "dead",
                    _ => "unknown",
                });
                Ok(Some(AgentContainer {
                    identity: inspected
                        .name
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    image: inspected.config.as_ref().and_then(|c| c.image.clone()),
                    status: Self::parse_status(status),
                    started_at: state.and_then(|s| s.started_at.clone()),
                    labels: inspected
                        .config
                        .and_then(|c| c.labels)
                        .unwrap_or_default(),
                    volume_mounts: inspected
                        .mounts
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|m| match (m.source, m.destination) {
                            (Some(src), Some(dst)) => Some(format!("{} => {}", src, dst)),
                            _ => None,
                        })
                        .collect(),
                    network_mode: inspected.host_config.and_then(|h| h.network_mode),
                }))
            }
            Err(e) if Self::is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, identity: &str) -> Result<StopOutcome> {
        info!(container = %identity, "stopping container");
        match self
            .client
            .stop_container(identity, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {}
            Err(e) if Self::is_not_found(&e) => return Ok(StopOutcome::NotFound),
            // 304: already stopped. Removal below still applies.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(container = %identity, "removing container");
        match self
            .client
            .remove_container(
                identity,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(StopOutcome::Stopped),
            Err(e) if Self::is_not_found(&e) => Ok(StopOutcome::Stopped),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, identity: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.client.create_exec(identity, exec_options).await?;
        let start_result = self.client.start_exec(&exec.id, None).await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = start_result {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message })
                    | Ok(bollard::container::LogOutput::StdErr { message }) => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn logs(&self, identity: &str, tail: Option<usize>) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let mut stream = self.client.logs(identity, Some(options));
        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output) => lines.push(output.to_string()),
                Err(e) => {
                    debug!(error = %e, "error reading log stream");
                    break;
                }
            }
        }
        Ok(lines)
    }

    async fn copy_file_out(&self, identity: &str, path: &str, dest: &Path) -> Result<()> {
        let options = DownloadFromContainerOptions { path: path.to_string() };
        let mut stream = self.client.download_from_container(identity, Some(options));
        let mut file = tokio::fs::File::create(dest).await?;
        // Archives can be large; write chunk by chunk instead of collecting.
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn usage(&self, identity: &str) -> Result<ResourceUsage> {
        let container = match self.inspect(identity).await? {
            Some(container) => container,
            None => return Ok(ResourceUsage::default()),
        };
        if container.status != ContainerStatus::Running {
            return Ok(ResourceUsage::default());
        }

        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stats_stream = self.client.stats(identity, Some(options));
        let mut usage = ResourceUsage::default();
        if let Some(Ok(stats)) = stats_stream.next().await {
            usage.cpu_pct = Self::calc_cpu_pct(&stats);
            usage.mem_usage_mb = stats.memory_stats.usage.unwrap_or(0) as f64 / 1024.0 / 1024.0;
        }

        if container.volume_mounts.is_empty() {
            let du = self
                .exec(identity, vec!["du".into(), "-sh".into(), "/".into()])
                .await?;
            usage.disk_usage = du
                .output
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
        } else {
            usage.disk_usage = "n/a (mounted disk)".to_string();
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_maps_engine_states() {
        assert_eq!(DockerAdapter::parse_status(Some("running")), ContainerStatus::Running);
        assert_eq!(DockerAdapter::parse_status(Some("exited")), ContainerStatus::Exited);
        assert_eq!(DockerAdapter::parse_status(None), ContainerStatus::Unknown);
    }
}
