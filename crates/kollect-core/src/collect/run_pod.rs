//! Run a caller-supplied pod or daemon-set and capture what it produced.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams};
use kube::{Api, Client};

use crate::error::CollectError;
use crate::rbac::AccessReviewRequest;
use crate::result::CollectorResult;
use crate::spec::{RunDaemonSet, RunPod};
use crate::workload::{self, WaitOptions};
use crate::RunContext;

use super::progress::{CollectProgress, ProgressSink};
use super::Collect;

/// Bound applied when the spec does not carry its own timeout.
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RunPodCollector {
    spec: RunPod,
    client: Client,
    ctx: Arc<RunContext>,
}

impl RunPodCollector {
    pub fn new(spec: RunPod, client: Client, ctx: Arc<RunContext>) -> Self {
        Self { spec, client, ctx }
    }

    fn namespace(&self) -> &str {
        self.spec
            .namespace
            .as_deref()
            .unwrap_or(&self.ctx.namespace)
    }

    fn run_name(&self) -> String {
        self.spec
            .name
            .clone()
            .or_else(|| self.spec.collector_name.clone())
            .unwrap_or_else(|| "run-pod".to_string())
    }

    fn timeout(&self) -> Duration {
        self.spec
            .timeout
            .clone()
            .map(Into::into)
            .unwrap_or(DEFAULT_RUN_TIMEOUT)
    }
}

#[async_trait]
impl Collect for RunPodCollector {
    fn title(&self) -> String {
        format!("run-pod/{}", self.run_name())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("create", "pods", Some(self.namespace())),
            AccessReviewRequest::new("delete", "pods", Some(self.namespace())),
            AccessReviewRequest::new("get", "pods/log", Some(self.namespace())),
        ]
    }

    async fn collect(&self, progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let name = self.run_name();
        let pod_spec = self
            .spec
            .pod_spec
            .clone()
            .ok_or_else(|| anyhow!("run collector {name} has no pod spec"))?;

        let ns = self.namespace().to_string();
        let workload = workload::create_pod(
            &self.client,
            &ns,
            "runPod",
            &name,
            pod_spec,
            self.spec.image_pull_secret.as_ref(),
        )
        .await?;

        let outcome = self
            .collect_from_pod(&ns, &name, &workload.name, progress)
            .await;
        workload.cleanup(&self.client).await;
        outcome
    }
}

impl RunPodCollector {
    async fn collect_from_pod(
        &self,
        ns: &str,
        name: &str,
        pod_name: &str,
        progress: &dyn ProgressSink,
    ) -> Result<CollectorResult> {
        let mut result = CollectorResult::new();
        let timeout = self.timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        let options = WaitOptions {
            retry_failed_mount: false,
            timeout: Some(timeout),
        };
        let ready_pod =
            workload::wait_for_pod_ready(&self.client, ns, pod_name, &self.ctx.cancel, &options)
                .await?;

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match workload::wait_for_pod_completed(
            &self.client,
            ns,
            pod_name,
            &self.ctx.cancel,
            Some(remaining),
        )
        .await
        {
            Ok(pod) => {
                result.save_json(&format!("{name}/{name}.json"), &pod)?;
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
                match pods.logs(pod_name, &LogParams::default()).await {
                    Ok(logs) => result.save_bytes(&format!("{name}/{name}.log"), logs.into_bytes())?,
                    Err(e) => result.save_errors(name, &[format!("reading pod logs: {e}")])?,
                }
            }
            Err(CollectError::CollectorTimeout(_)) => {
                // The pod never finished; keep the status snapshot taken
                // when it became ready and record the timeout.
                result.save_json(&format!("{name}/{name}.json"), &ready_pod)?;
                result.save_errors(
                    name,
                    &[format!("pod did not complete within {timeout:?}")],
                )?;
                progress.emit(CollectProgress::warning(format!(
                    "run-pod {name} timed out after {timeout:?}"
                )));
            }
            Err(e) => return Err(e).context("waiting for pod completion"),
        }

        Ok(result)
    }
}

pub struct RunDaemonSetCollector {
    spec: RunDaemonSet,
    client: Client,
    ctx: Arc<RunContext>,
}

impl RunDaemonSetCollector {
    pub fn new(spec: RunDaemonSet, client: Client, ctx: Arc<RunContext>) -> Self {
        Self { spec, client, ctx }
    }

    fn namespace(&self) -> &str {
        self.spec
            .namespace
            .as_deref()
            .unwrap_or(&self.ctx.namespace)
    }

    fn run_name(&self) -> String {
        self.spec
            .name
            .clone()
            .or_else(|| self.spec.collector_name.clone())
            .unwrap_or_else(|| "run-daemonset".to_string())
    }

    fn timeout(&self) -> Duration {
        self.spec
            .timeout
            .clone()
            .map(Into::into)
            .unwrap_or(DEFAULT_RUN_TIMEOUT)
    }
}

#[async_trait]
impl Collect for RunDaemonSetCollector {
    fn title(&self) -> String {
        format!("run-daemonset/{}", self.run_name())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("create", "daemonsets", Some(self.namespace())),
            AccessReviewRequest::new("delete", "daemonsets", Some(self.namespace())),
            AccessReviewRequest::new("list", "pods", Some(self.namespace())),
            AccessReviewRequest::new("get", "pods/log", Some(self.namespace())),
        ]
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let name = self.run_name();
        let pod_spec = self
            .spec
            .pod_spec
            .clone()
            .ok_or_else(|| anyhow!("run collector {name} has no pod spec"))?;

        let ns = self.namespace().to_string();
        let workload = workload::create_daemonset(
            &self.client,
            &ns,
            "runDaemonSet",
            &name,
            pod_spec,
            self.spec.image_pull_secret.as_ref(),
        )
        .await?;

        let outcome = self.collect_from_daemonset(&ns, &name, &workload).await;
        workload.cleanup(&self.client).await;
        outcome
    }
}

impl RunDaemonSetCollector {
    async fn collect_from_daemonset(
        &self,
        ns: &str,
        name: &str,
        workload: &workload::EphemeralWorkload,
    ) -> Result<CollectorResult> {
        let mut result = CollectorResult::new();
        let timeout = self.timeout();

        let daemonset = workload::wait_for_daemonset_ready(
            &self.client,
            ns,
            &workload.name,
            &self.ctx.cancel,
            Some(timeout),
        )
        .await?;
        result.save_json(&format!("{name}/{name}.json"), &daemonset)?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let listed = pods
            .list(&ListParams::default().labels(&workload.instance_selector()))
            .await
            .context("listing daemonset pods")?;

        let mut errors = Vec::new();
        for pod in &listed.items {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            // Key per-node output by the node when known.
            let key = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.as_deref())
                .unwrap_or(pod_name);
            match pods.logs(pod_name, &LogParams::default()).await {
                Ok(logs) => result.save_bytes(&format!("{name}/{key}.log"), logs.into_bytes())?,
                Err(e) => errors.push(format!("{pod_name}: {e}")),
            }
        }

        if !errors.is_empty() {
            result.save_errors(name, &errors)?;
        }
        Ok(result)
    }
}
