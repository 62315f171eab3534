//! Ephemeral cluster workload lifecycle.
//!
//! Several collectors create short-lived cluster objects: an image-pull
//! secret, a single pod, or a daemon-set. Every created object carries the
//! engine-managed labels and a fresh instance id, and is removed by a
//! cleanup stack that runs in reverse creation order on every exit path.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{Event, LocalObjectReference, Pod, PodSpec, PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use crate::error::CollectError;
use crate::spec::ImagePullSecret;

/// Label carried by every object the engine creates; downstream sweepers
/// key on it.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "troubleshoot.sh";

/// Label naming the collector kind that created the object.
pub const COLLECTOR_LABEL: &str = "kollect.dev/collector";

/// Label holding the per-invocation unique instance id.
pub const INSTANCE_LABEL: &str = "kollect.dev/instance";

/// Poll interval for readiness and deletion waits.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling on waiting for an image pull, independent of collector timeout.
const IMAGE_PULL_WAIT: Duration = Duration::from_secs(30);

/// Ceiling on waiting for deleted pods to disappear before force-deleting.
const MAX_POD_DELETION_WAIT: Duration = Duration::from_secs(30);

/// Options controlling readiness waits.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Keep waiting through `FailedMount` events instead of aborting.
    pub retry_failed_mount: bool,
    /// Overall bound on the wait; unbounded when `None` (the ambient
    /// cancellation signal still applies).
    pub timeout: Option<Duration>,
}

/// A created workload plus the stack of actions that removes it.
#[derive(Debug)]
pub struct EphemeralWorkload {
    pub namespace: String,
    pub name: String,
    pub instance_id: String,
    cleanup: Vec<CleanupAction>,
}

#[derive(Debug)]
enum CleanupAction {
    DeleteSecret { namespace: String, name: String },
    DeletePod { namespace: String, name: String },
    DeleteDaemonSet { namespace: String, name: String },
}

impl EphemeralWorkload {
    /// Label selector matching every object of this invocation.
    pub fn instance_selector(&self) -> String {
        format!("{}={}", INSTANCE_LABEL, self.instance_id)
    }

    /// Run the cleanup stack in reverse creation order.
    ///
    /// A failing action logs a warning and the stack continues; cleanup
    /// never masks the collector's own result or error.
    pub async fn cleanup(mut self, client: &Client) {
        while let Some(action) = self.cleanup.pop() {
            if let Err(e) = action.run(client).await {
                tracing::warn!(error = %e, "workload cleanup action failed");
            }
        }
    }
}

impl CleanupAction {
    async fn run(&self, client: &Client) -> Result<()> {
        match self {
            CleanupAction::DeleteSecret { namespace, name } => {
                let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
                secrets
                    .delete(name, &DeleteParams::default())
                    .await
                    .with_context(|| format!("deleting secret {name}"))?;
                Ok(())
            }
            CleanupAction::DeletePod { namespace, name } => {
                let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
                delete_pod_and_wait(&pods, name).await
            }
            CleanupAction::DeleteDaemonSet { namespace, name } => {
                let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
                daemonsets
                    .delete(name, &DeleteParams::foreground().grace_period(0))
                    .await
                    .with_context(|| format!("deleting daemonset {name}"))?;
                Ok(())
            }
        }
    }
}

/// Delete a pod with grace 0 and foreground propagation, poll until it
/// disappears, then force-delete any survivor.
async fn delete_pod_and_wait(pods: &Api<Pod>, name: &str) -> Result<()> {
    pods.delete(name, &DeleteParams::foreground().grace_period(0))
        .await
        .with_context(|| format!("deleting pod {name}"))?;

    let deadline = tokio::time::Instant::now() + MAX_POD_DELETION_WAIT;
    while tokio::time::Instant::now() < deadline {
        match pods.get(name).await {
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("polling deleted pod {name}")),
            Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }

    tracing::warn!(pod = %name, "pod survived deletion wait; force deleting");
    match pods.delete(name, &DeleteParams::default().grace_period(0)).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e).with_context(|| format!("force deleting pod {name}")),
    }
}

/// Engine-managed labels for a new workload.
pub fn workload_labels(kind: &str, instance_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (COLLECTOR_LABEL.to_string(), kind.to_string()),
        (INSTANCE_LABEL.to_string(), instance_id.to_string()),
    ])
}

/// Generate a unique workload name; re-runs after a crash never collide.
pub fn generate_name(base: &str) -> (String, String) {
    let instance_id = uuid::Uuid::new_v4().to_string();
    let short = &instance_id[..8];
    let base = base.trim_matches('-');
    (format!("{base}-{short}"), instance_id)
}

/// Create the image-pull secret from an inline docker-config body.
///
/// The `.dockerconfigjson` value arrives base64 encoded; it is decoded,
/// re-indented, and stored as a `kubernetes.io/dockerconfigjson` secret.
async fn create_pull_secret(
    client: &Client,
    namespace: &str,
    kind: &str,
    instance_id: &str,
    pull_secret: &ImagePullSecret,
) -> Result<Option<String>> {
    let Some(data) = &pull_secret.data else {
        // A bare name references a pre-existing secret; nothing to create.
        return Ok(None);
    };
    let encoded = data
        .get(".dockerconfigjson")
        .ok_or_else(|| anyhow!("image pull secret data has no .dockerconfigjson key"))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("decoding .dockerconfigjson")?;
    let config: serde_json::Value =
        serde_json::from_slice(&decoded).context("parsing docker config json")?;
    let reindented = serde_json::to_vec_pretty(&config)?;

    let base = pull_secret.name.as_deref().unwrap_or("kollect-pull");
    let (name, _) = generate_name(base);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(workload_labels(kind, instance_id)),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            k8s_openapi::ByteString(reindented),
        )])),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .create(&PostParams::default(), &secret)
        .await
        .context("creating image pull secret")?;
    Ok(Some(name))
}

/// Create a single pod owned by the calling collector.
///
/// Restart policy defaults to `Never`. The returned workload's cleanup
/// stack already covers the pod and any created pull secret.
pub async fn create_pod(
    client: &Client,
    namespace: &str,
    kind: &str,
    base_name: &str,
    mut pod_spec: PodSpec,
    pull_secret: Option<&ImagePullSecret>,
) -> Result<EphemeralWorkload> {
    let (name, instance_id) = generate_name(base_name);
    let mut workload = EphemeralWorkload {
        namespace: namespace.to_string(),
        name: name.clone(),
        instance_id: instance_id.clone(),
        cleanup: Vec::new(),
    };

    if let Some(pull_secret) = pull_secret {
        if let Some(secret_name) =
            create_pull_secret(client, namespace, kind, &instance_id, pull_secret).await?
        {
            workload.cleanup.push(CleanupAction::DeleteSecret {
                namespace: namespace.to_string(),
                name: secret_name.clone(),
            });
            pod_spec
                .image_pull_secrets
                .get_or_insert_with(Vec::new)
                .push(LocalObjectReference { name: secret_name });
        }
    }

    if pod_spec.restart_policy.is_none() {
        pod_spec.restart_policy = Some("Never".to_string());
    }

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(workload_labels(kind, &instance_id)),
            ..Default::default()
        },
        spec: Some(pod_spec),
        ..Default::default()
    };

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let created = match pods.create(&PostParams::default(), &pod).await {
        Ok(created) => created,
        Err(e) => {
            // The pull secret may already exist; unwind it.
            workload.cleanup(client).await;
            return Err(e).with_context(|| format!("creating pod {name}"));
        }
    };

    workload.name = created.metadata.name.unwrap_or(name);
    workload.cleanup.push(CleanupAction::DeletePod {
        namespace: namespace.to_string(),
        name: workload.name.clone(),
    });
    tracing::debug!(pod = %workload.name, namespace = %namespace, "created ephemeral pod");
    Ok(workload)
}

/// Create a daemon-set (one pod per schedulable node).
pub async fn create_daemonset(
    client: &Client,
    namespace: &str,
    kind: &str,
    base_name: &str,
    mut pod_spec: PodSpec,
    pull_secret: Option<&ImagePullSecret>,
) -> Result<EphemeralWorkload> {
    let (name, instance_id) = generate_name(base_name);
    let mut workload = EphemeralWorkload {
        namespace: namespace.to_string(),
        name: name.clone(),
        instance_id: instance_id.clone(),
        cleanup: Vec::new(),
    };

    if let Some(pull_secret) = pull_secret {
        if let Some(secret_name) =
            create_pull_secret(client, namespace, kind, &instance_id, pull_secret).await?
        {
            workload.cleanup.push(CleanupAction::DeleteSecret {
                namespace: namespace.to_string(),
                name: secret_name.clone(),
            });
            pod_spec
                .image_pull_secrets
                .get_or_insert_with(Vec::new)
                .push(LocalObjectReference { name: secret_name });
        }
    }

    let labels = workload_labels(kind, &instance_id);
    let daemonset = DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let created = match daemonsets.create(&PostParams::default(), &daemonset).await {
        Ok(created) => created,
        Err(e) => {
            workload.cleanup(client).await;
            return Err(e).with_context(|| format!("creating daemonset {name}"));
        }
    };

    workload.name = created.metadata.name.unwrap_or(name);
    workload.cleanup.push(CleanupAction::DeleteDaemonSet {
        namespace: namespace.to_string(),
        name: workload.name.clone(),
    });
    tracing::debug!(daemonset = %workload.name, namespace = %namespace, "created ephemeral daemonset");
    Ok(workload)
}

/// Wait until the pod reaches a terminal-or-running phase.
///
/// Polls at one-second intervals and inspects events for the failure
/// reasons that make further waiting pointless. The image-pull wait has
/// its own thirty-second ceiling independent of the caller's timeout.
pub async fn wait_for_pod_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
    options: &WaitOptions,
) -> Result<Pod, CollectError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let start = tokio::time::Instant::now();
    let deadline = options.timeout.map(|t| start + t);

    loop {
        if cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(CollectError::CollectorTimeout(
                    options.timeout.unwrap_or_default(),
                ));
            }
        }

        let pod = pods
            .get(name)
            .await
            .map_err(CollectError::ClusterUnavailable)?;
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");
        if matches!(phase, "Running" | "Succeeded" | "Failed") {
            return Ok(pod);
        }

        check_pending_pod(client, namespace, name, &pod, options, start.elapsed()).await?;
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Inspect a pending pod's events and container statuses for conditions
/// that abort the owning collector.
pub(crate) async fn check_pending_pod(
    client: &Client,
    namespace: &str,
    name: &str,
    pod: &Pod,
    options: &WaitOptions,
    waited: Duration,
) -> Result<(), CollectError> {
    let waiting_reason = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses.iter().find_map(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|s| s.waiting.as_ref())
                    .and_then(|w| w.reason.clone())
            })
        });

    if let Some(reason) = &waiting_reason {
        if reason == "ImagePullBackOff" || reason == "ErrImagePull" {
            return Err(CollectError::ImagePullFailed {
                pod: name.to_string(),
                message: format!("container image pull failed: {reason}"),
            });
        }
        if waited >= IMAGE_PULL_WAIT && reason.contains("Pull") {
            return Err(CollectError::ImagePullFailed {
                pod: name.to_string(),
                message: format!("image not pulled after {IMAGE_PULL_WAIT:?}"),
            });
        }
    }

    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    let listed = events
        .list(&ListParams::default().fields(&format!("involvedObject.name={name}")))
        .await
        .map_err(CollectError::ClusterUnavailable)?;

    for event in listed.items {
        let reason = event.reason.as_deref().unwrap_or("");
        let message = event.message.clone().unwrap_or_default();
        match reason {
            "FailedMount" if !options.retry_failed_mount => {
                return Err(CollectError::HostPathMissing {
                    pod: name.to_string(),
                    message,
                });
            }
            "FailedCreatePodSandBox" => {
                return Err(CollectError::SandboxCreationFailed {
                    pod: name.to_string(),
                    message,
                });
            }
            _ => {}
        }
    }

    Ok(())
}

/// Wait until the pod reaches `Succeeded` or `Failed`.
pub async fn wait_for_pod_completed(
    client: &Client,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<Pod, CollectError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

    loop {
        if cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(CollectError::CollectorTimeout(timeout.unwrap_or_default()));
            }
        }

        let pod = pods
            .get(name)
            .await
            .map_err(CollectError::ClusterUnavailable)?;
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");
        if matches!(phase, "Succeeded" | "Failed") {
            return Ok(pod);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until the daemon-set schedules at least one pod and every desired
/// pod is available.
pub async fn wait_for_daemonset_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<DaemonSet, CollectError> {
    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

    loop {
        if cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(CollectError::CollectorTimeout(timeout.unwrap_or_default()));
            }
        }

        let daemonset = daemonsets
            .get(name)
            .await
            .map_err(CollectError::ClusterUnavailable)?;
        if let Some(status) = &daemonset.status {
            if status.desired_number_scheduled > 0
                && status.number_available.unwrap_or(0) == status.desired_number_scheduled
            {
                return Ok(daemonset);
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Delete every engine-managed object in `namespace` matching `selector`.
///
/// Auxiliary garbage sweep for workloads leaked by a crashed run; the
/// engine itself never calls this.
pub async fn sweep_by_label(client: &Client, namespace: &str, selector: &str) -> Result<()> {
    let params = ListParams::default().labels(selector);
    let delete = DeleteParams::default().grace_period(0);

    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    daemonsets
        .delete_collection(&delete, &params)
        .await
        .context("sweeping daemonsets")?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    pods.delete_collection(&delete, &params)
        .await
        .context("sweeping pods")?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .delete_collection(&delete, &params)
        .await
        .context("sweeping secrets")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_are_unique() {
        let (a, id_a) = generate_name("runner");
        let (b, id_b) = generate_name("runner");
        assert_ne!(a, b);
        assert_ne!(id_a, id_b);
        assert!(a.starts_with("runner-"));
    }

    #[test]
    fn test_workload_labels() {
        let labels = workload_labels("copyFromHost", "abc-123");
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(labels[COLLECTOR_LABEL], "copyFromHost");
        assert_eq!(labels[INSTANCE_LABEL], "abc-123");
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_reverse_order_and_survives_failures() {
        use std::sync::{Arc, Mutex};

        let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        // Every delete fails with 404; cleanup must still visit every
        // action, newest first.
        let client = crate::testutil::mock_client(move |req| {
            if req.method() == http::Method::DELETE {
                calls_clone
                    .lock()
                    .unwrap()
                    .push(req.uri().path().to_string());
            }
            (
                http::StatusCode::NOT_FOUND,
                crate::testutil::not_found_body("pods", "gone"),
            )
        });

        let workload = EphemeralWorkload {
            namespace: "default".to_string(),
            name: "runner-abc".to_string(),
            instance_id: "abc".to_string(),
            cleanup: vec![
                CleanupAction::DeleteSecret {
                    namespace: "default".to_string(),
                    name: "pull-secret".to_string(),
                },
                CleanupAction::DeletePod {
                    namespace: "default".to_string(),
                    name: "runner-abc".to_string(),
                },
            ],
        };

        workload.cleanup(&client).await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("/pods/runner-abc"));
        assert!(calls[1].ends_with("/secrets/pull-secret"));
    }

    #[tokio::test]
    async fn test_sweep_by_label_hits_every_kind() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let client = crate::testutil::mock_client(move |req| {
            assert_eq!(req.method(), http::Method::DELETE);
            seen_clone.fetch_add(1, Ordering::SeqCst);
            (
                http::StatusCode::OK,
                crate::testutil::empty_list_body("Pod"),
            )
        });

        sweep_by_label(&client, "default", "kollect.dev/instance=abc")
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
