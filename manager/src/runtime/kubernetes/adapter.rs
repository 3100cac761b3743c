//! Kubernetes Adapter
//!
//! Implementation of RuntimeAdapter backed by a cluster API. Pod names are
//! the DNS-safe form of the container identity; the label contract rides in
//! pod annotations (label-value grammar cannot carry URLs or comma lists),
//! with a single filter label marking managed pods. Inspect and list read
//! those annotations back, so both backends present the same label map.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use crate::error::{Error, Result};
use crate::identity::pod_name_for;
use crate::runtime::adapter::{
    AgentContainer, ContainerStatus, ExecOutput, LaunchSpec, ResourceUsage, RuntimeAdapter,
    StopOutcome,
};

/// Filter label marking pods this manager owns.
const MANAGED_LABEL: &str = "bridge-managed";

/// Annotation carrying the original container identity (pod names lose the
/// underscores the identity scheme uses).
const IDENTITY_ANNOTATION: &str = "bridge-identity";

const AGENT_CONTAINER_NAME: &str = "bridge-agent";

/// Kubernetes runtime adapter.
pub struct KubernetesAdapter {
    pods: Api<Pod>,
    namespace: String,
}

impl KubernetesAdapter {
    /// Connect using the ambient kubeconfig or in-cluster environment.
    pub async fn new(namespace: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        })
    }

    fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(ae) if ae.code == 404)
    }

    fn parse_phase(phase: Option<&str>) -> ContainerStatus {
        match phase {
            Some("Pending") => ContainerStatus::Created,
            Some("Running") => ContainerStatus::Running,
            Some("Succeeded") => ContainerStatus::Exited,
            Some("Failed") => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    fn exit_code_from_status(status: &Status) -> i64 {
        if status.status.as_deref() == Some("Success") {
            return 0;
        }
        status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.parse().ok())
            .unwrap_or(1)
    }

    fn pod_to_container(pod: Pod) -> AgentContainer {
        let mut annotations = pod.metadata.annotations.unwrap_or_default();
        let identity = annotations
            .remove(IDENTITY_ANNOTATION)
            .unwrap_or_else(|| pod.metadata.name.clone().unwrap_or_default());

        let spec = pod.spec.as_ref();
        let image = spec
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone());

        let volume_mounts = spec
            .map(|s| {
                let host_paths: HashMap<String, String> = s
                    .volumes
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|v| {
                        v.host_path
                            .as_ref()
                            .map(|hp| (v.name.clone(), hp.path.clone()))
                    })
                    .collect();
                s.containers
                    .first()
                    .and_then(|c| c.volume_mounts.as_ref())
                    .map(|mounts| {
                        mounts
                            .iter()
                            .filter_map(|m| {
                                host_paths
                                    .get(&m.name)
                                    .map(|src| format!("{} => {}", src, m.mount_path))
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        let status = pod.status.as_ref();
        AgentContainer {
            identity,
            image,
            status: Self::parse_phase(status.and_then(|s| s.phase.as_deref())),
            started_at: status
                .and_then(|s| s.start_time.as_ref())
                .map(|t| t.0.to_rfc3339()),
            labels: annotations.into_iter().collect(),
            volume_mounts,
            network_mode: None,
        }
    }

    fn render_pod(&self, spec: &LaunchSpec) -> Result<Pod> {
        let pod_name = pod_name_for(&spec.identity);

        let mut annotations: HashMap<String, String> = spec.labels.clone();
        annotations.insert(IDENTITY_ANNOTATION.to_string(), spec.identity.clone());

        let env: Vec<serde_json::Value> = spec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for (index, binding) in spec.volumes.iter().enumerate() {
            let name = format!("vol{}", index);
            volumes.push(json!({
                "name": name,
                "hostPath": { "path": binding.source }
            }));
            mounts.push(json!({
                "name": name,
                "mountPath": binding.target,
                "readOnly": binding.read_only
            }));
        }

        let host_aliases: Vec<serde_json::Value> = spec
            .dns_mappings
            .iter()
            .map(|(host, addr)| json!({ "ip": addr, "hostnames": [host] }))
            .collect();

        let pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod_name,
                "namespace": self.namespace,
                "labels": { MANAGED_LABEL: "true" },
                "annotations": annotations,
            },
            "spec": {
                // The kubelet's crash-loop backoff bounds restart churn;
                // there is no per-pod retry cap equivalent to the engine's.
                "restartPolicy": "OnFailure",
                "hostNetwork": spec.network_mode.as_deref() == Some("host"),
                "hostAliases": host_aliases,
                "containers": [{
                    "name": AGENT_CONTAINER_NAME,
                    "image": spec.image,
                    "env": env,
                    "volumeMounts": mounts,
                }],
                "volumes": volumes,
            }
        }))?;
        Ok(pod)
    }
}

#[async_trait]
impl RuntimeAdapter for KubernetesAdapter {
    fn runtime_type(&self) -> &str {
        "kubernetes"
    }

    async fn ping(&self) -> Result<()> {
        self.pods
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<String> {
        let pod_name = pod_name_for(&spec.identity);
        if self.inspect(&spec.identity).await?.is_some() {
            return Err(Error::AlreadyRunning(spec.identity.clone()));
        }
        let pod = self.render_pod(spec)?;
        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(created) => {
                info!(pod = %pod_name, namespace = %self.namespace, "pod created");
                Ok(created.metadata.uid.unwrap_or(pod_name))
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::AlreadyRunning(spec.identity.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<AgentContainer>> {
        let params = ListParams::default().labels(&format!("{}=true", MANAGED_LABEL));
        let pods = self.pods.list(&params).await?;
        let mut by_identity = std::collections::BTreeMap::new();
        for pod in pods {
            let container = Self::pod_to_container(pod);
            by_identity.insert(container.identity.clone(), container);
        }
        Ok(by_identity.into_values().collect())
    }

    async fn inspect(&self, identity: &str) -> Result<Option<AgentContainer>> {
        let pod_name = pod_name_for(identity);
        let pod = self.pods.get_opt(&pod_name).await?;
        Ok(pod.map(Self::pod_to_container))
    }

    async fn stop(&self, identity: &str) -> Result<StopOutcome> {
        let pod_name = pod_name_for(identity);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self.pods.delete(&pod_name, &params).await {
            Ok(_) => {
                info!(pod = %pod_name, "pod deleted");
                Ok(StopOutcome::Stopped)
            }
            Err(e) if Self::is_not_found(&e) => Ok(StopOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, identity: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        let pod_name = pod_name_for(identity);
        let params = AttachParams::default()
            .container(AGENT_CONTAINER_NAME)
            .stdout(true)
            .stderr(true);
        let mut attached = self.pods.exec(&pod_name, cmd, &params).await?;

        let status_future = attached.take_status();
        let mut output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            output.push_str(&String::from_utf8_lossy(&buf));
        }
        if let Some(mut stderr) = attached.stderr() {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            output.push_str(&String::from_utf8_lossy(&buf));
        }

        let exit_code = match status_future {
            Some(future) => future
                .await
                .map(|status| Self::exit_code_from_status(&status))
                .unwrap_or(0),
            None => 0,
        };
        Ok(ExecOutput { exit_code, output })
    }

    async fn logs(&self, identity: &str, tail: Option<usize>) -> Result<Vec<String>> {
        let pod_name = pod_name_for(identity);
        let params = LogParams {
            timestamps: true,
            tail_lines: tail.map(|t| t as i64),
            ..Default::default()
        };
        let text = self.pods.logs(&pod_name, &params).await?;
        Ok(text.lines().map(str::to_string).collect())
    }

    async fn copy_file_out(&self, identity: &str, path: &str, dest: &Path) -> Result<()> {
        let pod_name = pod_name_for(identity);
        let params = AttachParams::default()
            .container(AGENT_CONTAINER_NAME)
            .stdout(true);
        let cmd = vec!["tar".to_string(), "cf".to_string(), "-".to_string(), path.to_string()];
        let mut attached = self.pods.exec(&pod_name, cmd, &params).await?;
        let mut stdout = attached
            .stdout()
            .ok_or_else(|| Error::Other("exec produced no stdout stream".into()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        tokio::io::copy(&mut stdout, &mut file).await?;
        file.flush().await?;
        let _ = attached.join().await;
        Ok(())
    }

    async fn usage(&self, identity: &str) -> Result<ResourceUsage> {
        // No stats source without a cluster metrics server; report disk
        // best-effort and leave cpu/memory zeroed.
        let container = match self.inspect(identity).await? {
            Some(container) => container,
            None => return Ok(ResourceUsage::default()),
        };
        if container.status != ContainerStatus::Running {
            return Ok(ResourceUsage::default());
        }
        let mut usage = ResourceUsage::default();
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
    fn parse_phase_maps_pod_phases() {
        assert_eq!(KubernetesAdapter::parse_phase(Some("Running")), ContainerStatus::Running);
        assert_eq!(KubernetesAdapter::parse_phase(Some("Failed")), ContainerStatus::Dead);
        assert_eq!(KubernetesAdapter::parse_phase(None), ContainerStatus::Unknown);
    }

    #[test]
    fn exit_code_parses_from_failure_causes() {
        let status: Status = serde_json::from_value(json!({
            "status": "Failure",
            "reason": "NonZeroExitCode",
            "details": {
                "causes": [{ "reason": "ExitCode", "message": "3" }]
            }
        }))
        .unwrap();
        assert_eq!(KubernetesAdapter::exit_code_from_status(&status), 3);

        let success: Status = serde_json::from_value(json!({ "status": "Success" })).unwrap();
        assert_eq!(KubernetesAdapter::exit_code_from_status(&success), 0);
    }

    #[test]
    fn pod_round_trips_identity_and_labels() {
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "bridge-mysite-token1",
                "labels": { "bridge-managed": "true" },
                "annotations": {
                    "bridge-identity": "bridge_mysite_token1",
                    "bridge_agent_name": "token1"
                }
            },
            "spec": {
                "containers": [{ "name": "bridge-agent", "image": "agent_rhel9" }]
            },
            "status": { "phase": "Running" }
        }))
        .unwrap();
        let container = KubernetesAdapter::pod_to_container(pod);
        assert_eq!(container.identity, "bridge_mysite_token1");
        assert_eq!(container.status, ContainerStatus::Running);
        assert_eq!(container.agent_name(), Some("token1"));
        // The internal identity annotation is not part of the label map.
        assert!(!container.labels.contains_key("bridge-identity"));
    }
}
