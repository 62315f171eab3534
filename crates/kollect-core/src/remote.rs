//! Per-node fan-out of host collectors.
//!
//! A host collector targeting every node matching a selector becomes one
//! ephemeral pod per node. Each pod runs the same collector against its
//! node's host namespaces and prints the wire document on stdout; this
//! dispatcher collects the documents, decodes them, and re-homes the
//! entries into a node-scoped subtree.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Container, Node, Pod, PodSpec, Toleration};
use kube::api::{ListParams, LogParams};
use kube::{Api, Client};

use crate::collect::progress::{CollectProgress, ProgressSink};
use crate::host::decode_wire;
use crate::result::CollectorResult;
use crate::spec::{selector_string, HostCollectorSpec};
use crate::workload::{self, WaitOptions};
use crate::RunContext;

/// Prefix of every remote host collector path.
const HOST_COLLECTORS_DIR: &str = "host-collectors";

/// Local output prefix stripped before re-homing under the node directory.
const LOCAL_SYSTEM_PREFIX: &str = "host-collectors/system/";

/// Run `spec` on every node matching `node_selector`.
///
/// Nodes fan out concurrently; one node's failure leaves the others
/// running. Only when every node fails does the dispatcher return the
/// first error. Zero matching nodes is an empty result plus a warning.
pub async fn dispatch_host_collector(
    client: &Client,
    ctx: &RunContext,
    progress: &dyn ProgressSink,
    spec: &HostCollectorSpec,
    node_selector: &[String],
) -> Result<CollectorResult> {
    let nodes: Api<Node> = Api::all(client.clone());
    let mut params = ListParams::default();
    if !node_selector.is_empty() {
        params = params.labels(&selector_string(node_selector));
    }
    let node_list = nodes.list(&params).await.context("listing nodes")?;

    let node_names: Vec<String> = node_list
        .items
        .iter()
        .filter_map(|n| n.metadata.name.clone())
        .collect();

    if node_names.is_empty() {
        progress.emit(CollectProgress::warning(format!(
            "host collector {} matched no nodes",
            spec.kind()
        )));
        return Ok(CollectorResult::new());
    }

    let tasks = node_names.iter().map(|node| {
        let client = client.clone();
        async move { run_on_node(&client, ctx, spec, node).await }
    });
    let outcomes = join_all(tasks).await;

    let mut merged = CollectorResult::new();
    let mut failures = Vec::new();
    for (node, outcome) in node_names.iter().zip(outcomes) {
        match outcome {
            Ok(result) => {
                for key in result.keys().map(str::to_string).collect::<Vec<_>>() {
                    if merged.contains_key(&key) {
                        tracing::warn!(node = %node, path = %key, "duplicate host collector path; later node wins");
                    }
                }
                merged.add_result(result);
            }
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "host collector failed on node");
                progress.emit(CollectProgress::warning(format!(
                    "host collector {} failed on node {node}: {e}",
                    spec.kind()
                )));
                failures.push((node.clone(), e));
            }
        }
    }

    if failures.len() == node_names.len() {
        let (node, first) = &failures[0];
        return Err(anyhow!(
            "host collector {} failed on all {} nodes; first failure on {node}: {first}",
            spec.kind(),
            node_names.len()
        ));
    }

    Ok(merged)
}

/// Launch the runner pod on one node, wait for it to finish, and decode
/// its stdout into node-scoped result entries.
async fn run_on_node(
    client: &Client,
    ctx: &RunContext,
    spec: &HostCollectorSpec,
    node: &str,
) -> Result<CollectorResult> {
    let pod_spec = runner_pod_spec(ctx, spec, node)?;
    let workload = workload::create_pod(
        client,
        &ctx.namespace,
        spec.kind(),
        &format!("kollect-{}", spec.kind().to_lowercase()),
        pod_spec,
        None,
    )
    .await?;

    let outcome = collect_node_output(client, ctx, spec, node, &workload.name).await;
    workload.cleanup(client).await;
    outcome
}

async fn collect_node_output(
    client: &Client,
    ctx: &RunContext,
    spec: &HostCollectorSpec,
    node: &str,
    pod_name: &str,
) -> Result<CollectorResult> {
    let options = WaitOptions {
        retry_failed_mount: false,
        timeout: Some(ctx.timeout),
    };
    workload::wait_for_pod_ready(client, &ctx.namespace, pod_name, &ctx.cancel, &options).await?;
    let pod =
        workload::wait_for_pod_completed(client, &ctx.namespace, pod_name, &ctx.cancel, Some(ctx.timeout))
            .await?;

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    let pods: Api<Pod> = Api::namespaced(client.clone(), &ctx.namespace);
    let logs = pods
        .logs(pod_name, &LogParams::default())
        .await
        .with_context(|| format!("reading runner logs from {pod_name}"))?;

    if phase == "Failed" {
        anyhow::bail!("runner pod on node {node} failed: {}", logs.trim());
    }

    let mut result = CollectorResult::new();
    for (path, data) in decode_wire(&logs)? {
        result.save_bytes(&node_scoped_path(spec, node, &path), data)?;
    }
    Ok(result)
}

/// Re-home a pod-local output path under `host-collectors/<kind>/<node>/`.
fn node_scoped_path(spec: &HostCollectorSpec, node: &str, original: &str) -> String {
    let remainder = original
        .strip_prefix(LOCAL_SYSTEM_PREFIX)
        .unwrap_or(original);
    format!("{HOST_COLLECTORS_DIR}/{}/{node}/{remainder}", spec.kind())
}

/// The pod spec for one node of the fan-out: pinned to the node's
/// hostname, tolerating control-plane taints, sharing the host's network
/// and pid namespaces.
fn runner_pod_spec(ctx: &RunContext, spec: &HostCollectorSpec, node: &str) -> Result<PodSpec> {
    let spec_json =
        serde_json::to_string(spec).context("serialising host collector spec for the runner")?;

    Ok(PodSpec {
        restart_policy: Some("Never".to_string()),
        host_network: Some(true),
        host_pid: Some(true),
        node_selector: Some(BTreeMap::from([(
            "kubernetes.io/hostname".to_string(),
            node.to_string(),
        )])),
        tolerations: Some(vec![
            Toleration {
                key: Some("node-role.kubernetes.io/control-plane".to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            },
            Toleration {
                key: Some("node-role.kubernetes.io/master".to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            },
        ]),
        containers: vec![Container {
            name: "collector".to_string(),
            image: Some(ctx.runner_image.clone()),
            image_pull_policy: Some(ctx.image_pull_policy.clone()),
            args: Some(vec!["host-collect".to_string(), spec_json]),
            ..Default::default()
        }],
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::HostCollectorMeta;

    fn cpu_spec() -> HostCollectorSpec {
        HostCollectorSpec::Cpu(HostCollectorMeta::default())
    }

    #[test]
    fn test_node_scoped_path_strips_local_prefix() {
        let spec = cpu_spec();
        assert_eq!(
            node_scoped_path(&spec, "node-a", "host-collectors/system/cpu.json"),
            "host-collectors/cpu/node-a/cpu.json"
        );
        assert_eq!(
            node_scoped_path(&spec, "node-a", "extra/raw.txt"),
            "host-collectors/cpu/node-a/extra/raw.txt"
        );
    }

    #[test]
    fn test_runner_pod_spec_targets_node() {
        let ctx = RunContext::for_tests();
        let pod_spec = runner_pod_spec(&ctx, &cpu_spec(), "node-b").unwrap();

        let selector = pod_spec.node_selector.unwrap();
        assert_eq!(selector["kubernetes.io/hostname"], "node-b");
        assert_eq!(pod_spec.host_network, Some(true));
        assert_eq!(pod_spec.containers.len(), 1);

        let args = pod_spec.containers[0].args.clone().unwrap();
        assert_eq!(args[0], "host-collect");
        let parsed: HostCollectorSpec = serde_json::from_str(&args[1]).unwrap();
        assert_eq!(parsed.kind(), "cpu");
    }
}
