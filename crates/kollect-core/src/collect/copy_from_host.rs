//! Copy a host path from every node through an ephemeral daemon-set.
//!
//! One daemon-set pod per node mounts the requested host path read-only;
//! the collector archives the mount with `tar` through the exec channel
//! and stores the archive (or its extracted entries) per node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use kube::api::ListParams;
use kube::{Api, Client};

use crate::exec::{exec_in_pod, ExecRequest};
use crate::rbac::AccessReviewRequest;
use crate::result::CollectorResult;
use crate::spec::CopyFromHost;
use crate::workload::{self, WaitOptions};
use crate::RunContext;

use super::progress::{CollectProgress, ProgressSink};
use super::Collect;

/// Where the host path is mounted inside each daemon-set pod.
const HOST_MOUNT: &str = "/kollect/host";

const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct CopyFromHostCollector {
    spec: CopyFromHost,
    client: Client,
    ctx: Arc<RunContext>,
}

impl CopyFromHostCollector {
    pub fn new(spec: CopyFromHost, client: Client, ctx: Arc<RunContext>) -> Self {
        Self { spec, client, ctx }
    }

    fn namespace(&self) -> &str {
        self.spec
            .namespace
            .as_deref()
            .unwrap_or(&self.ctx.namespace)
    }

    fn dir_name(&self) -> String {
        self.spec
            .name
            .clone()
            .or_else(|| self.spec.collector_name.clone())
            .unwrap_or_else(|| self.spec.host_path.clone())
    }

    fn timeout(&self) -> Duration {
        self.spec
            .timeout
            .clone()
            .map(Into::into)
            .unwrap_or(DEFAULT_COPY_TIMEOUT)
    }

    fn pod_spec(&self) -> PodSpec {
        let image = self
            .spec
            .image
            .clone()
            .unwrap_or_else(|| self.ctx.runner_image.clone());
        let pull_policy = self
            .spec
            .image_pull_policy
            .clone()
            .unwrap_or_else(|| self.ctx.image_pull_policy.clone());

        PodSpec {
            containers: vec![Container {
                name: "copy".to_string(),
                image: Some(image),
                image_pull_policy: Some(pull_policy),
                command: Some(vec!["sleep".to_string(), "1000000".to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "host".to_string(),
                    mount_path: HOST_MOUNT.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "host".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: self.spec.host_path.clone(),
                    type_: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    /// Wait for the daemon-set to come up, surfacing pending-pod failures
    /// (missing host path, image pull, sandbox) instead of stalling until
    /// the deadline.
    async fn wait_ready(&self, ns: &str, workload: &workload::EphemeralWorkload) -> Result<()> {
        let timeout = self.timeout();
        let start = tokio::time::Instant::now();
        let deadline = start + timeout;
        let daemonsets: kube::Api<k8s_openapi::api::apps::v1::DaemonSet> =
            kube::Api::namespaced(self.client.clone(), ns);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let options = WaitOptions {
            retry_failed_mount: false,
            timeout: Some(timeout),
        };

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(crate::error::CollectError::Cancelled.into());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(crate::error::CollectError::CollectorTimeout(timeout).into());
            }

            let daemonset = daemonsets
                .get(&workload.name)
                .await
                .context("reading daemonset status")?;
            if let Some(status) = &daemonset.status {
                if status.desired_number_scheduled > 0
                    && status.number_available.unwrap_or(0) == status.desired_number_scheduled
                {
                    return Ok(());
                }
            }

            let listed = pods
                .list(&ListParams::default().labels(&workload.instance_selector()))
                .await
                .context("listing daemonset pods")?;
            for pod in &listed.items {
                let Some(pod_name) = pod.metadata.name.as_deref() else {
                    continue;
                };
                workload::check_pending_pod(
                    &self.client,
                    ns,
                    pod_name,
                    pod,
                    &options,
                    start.elapsed(),
                )
                .await?;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Archive the mount on one pod and store it under the node directory.
    async fn copy_from_pod(
        &self,
        result: &mut CollectorResult,
        progress: &dyn ProgressSink,
        pod: &Pod,
    ) -> Result<()> {
        let dir = self.dir_name();
        let pod_name = pod
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("daemonset pod has no name"))?;
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or(pod_name);

        let request = ExecRequest {
            namespace: self.namespace().to_string(),
            pod: pod_name.to_string(),
            container: Some("copy".to_string()),
            command: vec![
                "tar".to_string(),
                "-C".to_string(),
                HOST_MOUNT.to_string(),
                "-cf".to_string(),
                "-".to_string(),
                ".".to_string(),
            ],
            timeout: Some(self.timeout()),
        };
        let output = exec_in_pod(&self.client, &self.ctx.cancel, &request).await?;
        if let Some(error) = output.error_message() {
            return Err(anyhow!("archiving {} on {node}: {error}", self.spec.host_path));
        }

        if self.spec.extract_archive {
            extract_archive(result, progress, &dir, node, &output.stdout)?;
        } else {
            result
                .save_result(
                    self.ctx.bundle_root(),
                    &format!("{dir}/{node}/archive.tar"),
                    &output.stdout[..],
                )
                .await?;
        }
        Ok(())
    }
}

/// Unpack regular files from the archive; a corrupt tail is recovered
/// best-effort with a warning and the entries read so far are kept.
fn extract_archive(
    result: &mut CollectorResult,
    progress: &dyn ProgressSink,
    dir: &str,
    node: &str,
    archive: &[u8],
) -> Result<()> {
    let mut reader = tar::Archive::new(archive);
    let entries = match reader.entries() {
        Ok(entries) => entries,
        Err(e) => {
            progress.emit(CollectProgress::warning(format!(
                "unreadable archive from {node}: {e}"
            )));
            return Ok(());
        }
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                progress.emit(CollectProgress::warning(format!(
                    "partial archive from {node}: {e}"
                )));
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let mut data = Vec::new();
        use std::io::Read as _;
        if let Err(e) = entry.read_to_end(&mut data) {
            progress.emit(CollectProgress::warning(format!(
                "partial archive entry {path} from {node}: {e}"
            )));
            break;
        }
        result.save_bytes(&format!("{dir}/{node}/{path}"), data)?;
    }
    Ok(())
}

#[async_trait]
impl Collect for CopyFromHostCollector {
    fn title(&self) -> String {
        format!("copy-from-host/{}", self.dir_name())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("create", "daemonsets", Some(self.namespace())),
            AccessReviewRequest::new("delete", "daemonsets", Some(self.namespace())),
            AccessReviewRequest::new("list", "pods", Some(self.namespace())),
            AccessReviewRequest::new("create", "pods/exec", Some(self.namespace())),
        ]
    }

    async fn collect(&self, progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let ns = self.namespace().to_string();
        let workload = workload::create_daemonset(
            &self.client,
            &ns,
            "copyFromHost",
            "kollect-copyfromhost",
            self.pod_spec(),
            self.spec.image_pull_secret.as_ref(),
        )
        .await?;

        let outcome = async {
            self.wait_ready(&ns, &workload).await?;

            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &ns);
            let listed = pods
                .list(&ListParams::default().labels(&workload.instance_selector()))
                .await
                .context("listing daemonset pods")?;

            let mut result = CollectorResult::new();
            let mut errors = Vec::new();
            for pod in &listed.items {
                if let Err(e) = self.copy_from_pod(&mut result, progress, pod).await {
                    tracing::warn!(error = %e, "copy-from-host failed on pod");
                    errors.push(e.to_string());
                }
            }
            if !errors.is_empty() {
                result.save_errors(&self.dir_name(), &errors)?;
            }
            Ok(result)
        }
        .await;

        workload.cleanup(&self.client).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::progress::NoOpProgress;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_archive_unpacks_files() {
        let archive = tar_with(&[("etc/hostname", b"node-a\n"), ("etc/hosts", b"127.0.0.1\n")]);
        let mut result = CollectorResult::new();

        extract_archive(&mut result, &NoOpProgress, "host-files", "node-a", &archive).unwrap();

        let data =
            futures::executor::block_on(result.get_bytes("host-files/node-a/etc/hostname"))
                .unwrap();
        assert_eq!(&data[..], b"node-a\n");
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_extract_archive_recovers_partial_stream() {
        let mut archive = tar_with(&[("etc/hostname", b"node-a\n")]);
        // Drop the end-of-archive blocks and corrupt the tail.
        archive.truncate(archive.len() / 2);
        let mut result = CollectorResult::new();

        extract_archive(&mut result, &NoOpProgress, "host-files", "node-a", &archive).unwrap();
        // The single complete entry survives; nothing panics on the tail.
        assert!(result.len() <= 1);
    }

    #[tokio::test]
    async fn test_pod_spec_mounts_host_path() {
        let collector = CopyFromHostCollector::new(
            CopyFromHost {
                host_path: "/etc/hostname".to_string(),
                ..Default::default()
            },
            crate::testutil::mock_client(|_| (http::StatusCode::OK, Vec::new())),
            Arc::new(crate::RunContext::for_tests()),
        );

        let pod_spec = collector.pod_spec();
        let volume = &pod_spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.host_path.as_ref().unwrap().path,
            "/etc/hostname"
        );
        let mount = &pod_spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, HOST_MOUNT);
        assert_eq!(mount.read_only, Some(true));
    }
}
