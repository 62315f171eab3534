//! Collector contract, registry, and the orchestration loop.
//!
//! The orchestrator drives the ordered collector list sequentially: merge
//! same-kind entries, preflight access reviews, then run each collector,
//! isolating failures so one bad collector cannot poison the bundle.

pub mod cluster_info;
pub mod copy_from_host;
pub mod data;
pub mod exec;
pub mod host_remote;
pub mod http;
pub mod logs;
pub mod progress;
pub mod resources;
pub mod run_pod;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use kube::Client;

use crate::error::CollectError;
use crate::rbac::{self, AccessReviewRequest};
use crate::result::CollectorResult;
use crate::spec::CollectorSpec;
use crate::RunContext;

use progress::{CollectProgress, ProgressSink};

pub use cluster_info::ClusterInfoCollector;
pub use copy_from_host::CopyFromHostCollector;
pub use data::DataCollector;
pub use exec::ExecCollector;
pub use host_remote::{make_remote_collector, RemoteHostCollector};
pub use http::HttpCollector;
pub use logs::LogsCollector;
pub use resources::{ClusterResourcesCollector, ConfigMapCollector, SecretCollector};
pub use run_pod::{RunDaemonSetCollector, RunPodCollector};

/// Uniform contract every collector implements.
#[async_trait]
pub trait Collect: Send + Sync {
    /// Short, stable human label used in progress reports.
    fn title(&self) -> String;

    /// Whether the collector should be skipped entirely.
    fn is_excluded(&self) -> Result<bool>;

    /// Operations the access-review preflight must confirm.
    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        Vec::new()
    }

    /// Ask the downstream pipeline to leave this collector's output
    /// verbatim.
    fn skip_redaction(&self) -> bool {
        false
    }

    /// Produce this collector's portion of the bundle. Any ephemeral side
    /// effects are released before this returns.
    async fn collect(&self, progress: &dyn ProgressSink) -> Result<CollectorResult>;
}

/// Resolve a spec entry to a concrete collector.
///
/// Unknown variants return `None`; the orchestrator reports and skips the
/// entry.
pub fn make_collector(
    spec: CollectorSpec,
    client: Client,
    ctx: Arc<RunContext>,
) -> Option<Box<dyn Collect>> {
    match spec {
        CollectorSpec::ClusterInfo(spec) => Some(Box::new(ClusterInfoCollector::new(spec, client))),
        CollectorSpec::ClusterResources(spec) => {
            Some(Box::new(ClusterResourcesCollector::new(spec, client)))
        }
        CollectorSpec::ConfigMap(spec) => Some(Box::new(ConfigMapCollector::new(spec, client, ctx))),
        CollectorSpec::Secret(spec) => Some(Box::new(SecretCollector::new(spec, client, ctx))),
        CollectorSpec::Logs(spec) => Some(Box::new(LogsCollector::new(spec, client, ctx))),
        CollectorSpec::Exec(spec) => Some(Box::new(ExecCollector::new(spec, client, ctx))),
        CollectorSpec::RunPod(spec) => Some(Box::new(RunPodCollector::new(spec, client, ctx))),
        CollectorSpec::RunDaemonSet(spec) => {
            Some(Box::new(RunDaemonSetCollector::new(spec, client, ctx)))
        }
        CollectorSpec::CopyFromHost(spec) => {
            Some(Box::new(CopyFromHostCollector::new(spec, client, ctx)))
        }
        CollectorSpec::Http(spec) => Some(Box::new(HttpCollector::new(spec, client, ctx))),
        CollectorSpec::Data(spec) => Some(Box::new(DataCollector::new(spec))),
        CollectorSpec::Other(_) => None,
    }
}

/// Coalesce same-kind entries before the run.
///
/// Cluster-resources entries collapse into the first occurrence's
/// position with their namespace sets unioned and deduplicated; an entry
/// with an empty namespace list means "all namespaces" and wins the
/// union. Other kinds pass through unchanged.
pub fn merge_specs(specs: Vec<CollectorSpec>) -> Vec<CollectorSpec> {
    let mut merged: Vec<CollectorSpec> = Vec::with_capacity(specs.len());
    let mut cluster_resources_at: Option<usize> = None;

    for spec in specs {
        match spec {
            CollectorSpec::ClusterResources(incoming) => match cluster_resources_at {
                None => {
                    cluster_resources_at = Some(merged.len());
                    merged.push(CollectorSpec::ClusterResources(incoming));
                }
                Some(index) => {
                    let CollectorSpec::ClusterResources(existing) = &mut merged[index] else {
                        unreachable!("index points at a cluster-resources entry");
                    };
                    // Either entry asking for all namespaces wins.
                    if existing.namespaces.is_empty() || incoming.namespaces.is_empty() {
                        existing.namespaces.clear();
                    } else {
                        for ns in incoming.namespaces {
                            if !existing.namespaces.contains(&ns) {
                                existing.namespaces.push(ns);
                            }
                        }
                    }
                }
            },
            other => merged.push(other),
        }
    }

    merged
}

/// Drives one bundle: spec list in, merged [`CollectorResult`] out.
pub struct Orchestrator {
    client: Client,
    ctx: Arc<RunContext>,
}

impl Orchestrator {
    pub fn new(client: Client, ctx: Arc<RunContext>) -> Self {
        Self { client, ctx }
    }

    /// Run the ordered collector list.
    ///
    /// Bundle-level errors come only from the preflight or cancellation;
    /// individual collector failures are reported through the progress
    /// sink and the run continues.
    pub async fn run(
        &self,
        specs: Vec<CollectorSpec>,
        progress: &dyn ProgressSink,
    ) -> Result<CollectorResult, CollectError> {
        let mut collectors = Vec::new();
        for spec in merge_specs(specs) {
            let kind = spec.kind();
            match make_collector(spec, self.client.clone(), self.ctx.clone()) {
                Some(collector) => collectors.push(collector),
                None => {
                    tracing::warn!(kind = %kind, "skipping unknown collector variant");
                    progress.emit(CollectProgress::warning(format!(
                        "skipping unknown collector variant {kind}"
                    )));
                }
            }
        }

        let excluded_by_rbac = self.preflight(&collectors, progress).await?;
        Ok(self
            .run_list(collectors, &excluded_by_rbac, progress)
            .await)
    }

    /// Run pre-built collectors without preflighting; for callers that
    /// bring their own [`Collect`] implementations.
    pub async fn run_collectors(
        &self,
        collectors: Vec<Box<dyn Collect>>,
        progress: &dyn ProgressSink,
    ) -> CollectorResult {
        self.run_list(collectors, &Default::default(), progress).await
    }

    async fn run_list(
        &self,
        collectors: Vec<Box<dyn Collect>>,
        excluded_by_rbac: &std::collections::HashSet<String>,
        progress: &dyn ProgressSink,
    ) -> CollectorResult {
        let total = collectors.len();
        let mut bundle = CollectorResult::new();
        let deadline = tokio::time::Instant::now() + self.ctx.timeout;

        for (index, collector) in collectors.iter().enumerate() {
            if self.ctx.cancel.is_cancelled() {
                progress.emit(CollectProgress::warning("collection cancelled"));
                break;
            }

            let title = collector.title();
            match collector.is_excluded() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(collector = %title, error = %e, "exclude check failed; skipping");
                    continue;
                }
            }
            if excluded_by_rbac.contains(&title) {
                continue;
            }

            progress.emit(CollectProgress::Running {
                name: title.clone(),
                completed: index,
                total,
            });

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                progress.emit(CollectProgress::Failed {
                    name: title.clone(),
                    error: CollectError::CollectorTimeout(self.ctx.timeout).to_string(),
                    completed: index,
                    total,
                });
                self.ctx.cancel.cancel();
                break;
            }

            // A panicking collector must not poison the bundle.
            let outcome = tokio::time::timeout(
                remaining,
                std::panic::AssertUnwindSafe(collector.collect(progress)).catch_unwind(),
            )
            .await;

            match outcome {
                Ok(Ok(Ok(result))) => {
                    bundle.add_result(result);
                    progress.emit(CollectProgress::Completed {
                        name: title,
                        completed: index + 1,
                        total,
                    });
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(collector = %title, error = %e, "collector failed");
                    progress.emit(CollectProgress::Failed {
                        name: title,
                        error: format!("{e:#}"),
                        completed: index + 1,
                        total,
                    });
                }
                Ok(Err(_panic)) => {
                    tracing::error!(collector = %title, "collector panicked");
                    progress.emit(CollectProgress::Failed {
                        name: title,
                        error: "collector panicked".to_string(),
                        completed: index + 1,
                        total,
                    });
                }
                Err(_) => {
                    // The bundle deadline fired mid-collector; tear down
                    // in-flight work and stop.
                    progress.emit(CollectProgress::Failed {
                        name: title,
                        error: CollectError::CollectorTimeout(self.ctx.timeout).to_string(),
                        completed: index + 1,
                        total,
                    });
                    self.ctx.cancel.cancel();
                    break;
                }
            }
        }

        bundle
    }

    /// Run the access-review preflight and apply the partial-collection
    /// policy. Returns the titles excluded by denials.
    async fn preflight(
        &self,
        collectors: &[Box<dyn Collect>],
        progress: &dyn ProgressSink,
    ) -> Result<std::collections::HashSet<String>, CollectError> {
        let declared: Vec<(String, Vec<AccessReviewRequest>)> = collectors
            .iter()
            .map(|c| (c.title(), c.access_requests()))
            .filter(|(_, requests)| !requests.is_empty())
            .collect();

        if declared.is_empty() {
            return Ok(Default::default());
        }

        let report = rbac::preflight(&self.client, &declared).await?;
        if report.is_clean() {
            return Ok(Default::default());
        }

        if !self.ctx.allow_partial {
            return Err(CollectError::InsufficientPermissions(report.forbidden));
        }

        for denial in &report.forbidden {
            progress.emit(CollectProgress::warning(format!(
                "skipping forbidden operation: {denial}"
            )));
        }
        Ok(report.excluded_titles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::progress::ChannelProgress;
    use crate::spec::ClusterResources;

    struct StubCollector {
        title: &'static str,
        excluded: bool,
        fail: bool,
        panic: bool,
    }

    impl StubCollector {
        fn ok(title: &'static str) -> Self {
            Self {
                title,
                excluded: false,
                fail: false,
                panic: false,
            }
        }
    }

    #[async_trait]
    impl Collect for StubCollector {
        fn title(&self) -> String {
            self.title.to_string()
        }

        fn is_excluded(&self) -> Result<bool> {
            Ok(self.excluded)
        }

        async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
            if self.panic {
                panic!("stub collector panic");
            }
            if self.fail {
                anyhow::bail!("stub collector failure");
            }
            let mut result = CollectorResult::new();
            result.save_bytes(&format!("{}/out.txt", self.title), &b"ok"[..])?;
            Ok(result)
        }
    }

    fn cluster_resources(namespaces: &[&str]) -> CollectorSpec {
        CollectorSpec::ClusterResources(ClusterResources {
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_merge_unions_namespaces_at_first_position() {
        let specs = vec![
            cluster_resources(&["a"]),
            CollectorSpec::Data(Default::default()),
            cluster_resources(&["b", "a"]),
        ];

        let merged = merge_specs(specs);
        assert_eq!(merged.len(), 2);
        match &merged[0] {
            CollectorSpec::ClusterResources(cr) => {
                assert_eq!(cr.namespaces, vec!["a", "b"]);
            }
            other => panic!("wrong variant at position 0: {other:?}"),
        }
    }

    #[test]
    fn test_merge_empty_namespace_list_means_all() {
        let merged = merge_specs(vec![cluster_resources(&["a"]), cluster_resources(&[])]);
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            CollectorSpec::ClusterResources(cr) => assert!(cr.namespaces.is_empty()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    async fn run_stubs(stubs: Vec<StubCollector>) -> (CollectorResult, Vec<CollectProgress>) {
        let ctx = Arc::new(crate::RunContext::for_tests());
        let (sink, mut rx) = ChannelProgress::new();

        // Drive the collector loop directly against stubs.
        let orchestrator = Orchestrator::new(
            crate::testutil::mock_client(|_| (::http::StatusCode::OK, Vec::new())),
            ctx,
        );
        let collectors: Vec<Box<dyn Collect>> = stubs
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn Collect>)
            .collect();

        let bundle = orchestrator.run_collectors(collectors, &sink).await;
        drop(sink);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (bundle, events)
    }

    fn denied_review_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SelfSubjectAccessReview",
            "spec": {},
            "status": {"allowed": false}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_denied_preflight_fails_run_before_any_collector() {
        let client = crate::testutil::mock_client(|req| {
            // Only access reviews may reach the cluster.
            assert!(req.uri().path().contains("selfsubjectaccessreviews"));
            (::http::StatusCode::CREATED, denied_review_body())
        });
        let ctx = Arc::new(crate::RunContext::for_tests());
        let orchestrator = Orchestrator::new(client, ctx);

        let outcome = orchestrator
            .run(vec![cluster_resources(&["default"])], &progress::NoOpProgress)
            .await;

        match outcome {
            Err(CollectError::InsufficientPermissions(denials)) => {
                assert!(!denials.is_empty());
                assert!(denials.iter().any(|d| d.resource == "nodes"));
            }
            other => panic!("expected InsufficientPermissions, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_collection_demotes_denials_to_warnings() {
        let client = crate::testutil::mock_client(|req| {
            assert!(req.uri().path().contains("selfsubjectaccessreviews"));
            (::http::StatusCode::CREATED, denied_review_body())
        });
        let ctx = Arc::new(crate::RunContext::for_tests().with_allow_partial(true));
        let orchestrator = Orchestrator::new(client, ctx);

        let (sink, mut rx) = ChannelProgress::new();
        let bundle = orchestrator
            .run(vec![cluster_resources(&["default"])], &sink)
            .await
            .unwrap();

        // The denied collector is excluded; nothing else ran.
        assert!(bundle.is_empty());
        drop(sink);
        let mut saw_warning = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CollectProgress::Warning { .. }) {
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let (bundle, events) = run_stubs(vec![
            StubCollector::ok("first"),
            StubCollector {
                title: "boom",
                excluded: false,
                fail: true,
                panic: false,
            },
            StubCollector::ok("third"),
        ])
        .await;

        assert!(bundle.contains_key("first/out.txt"));
        assert!(bundle.contains_key("third/out.txt"));
        assert!(!bundle.contains_key("boom/out.txt"));

        let failed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, CollectProgress::Failed { .. }))
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let (bundle, _) = run_stubs(vec![
            StubCollector {
                title: "panics",
                excluded: false,
                fail: false,
                panic: true,
            },
            StubCollector::ok("after"),
        ])
        .await;

        assert!(bundle.contains_key("after/out.txt"));
    }

    #[tokio::test]
    async fn test_excluded_collector_never_runs() {
        let (bundle, events) = run_stubs(vec![
            StubCollector {
                title: "skipped",
                excluded: true,
                fail: false,
                panic: false,
            },
            StubCollector::ok("ran"),
        ])
        .await;

        assert!(!bundle.contains_key("skipped/out.txt"));
        assert!(bundle.contains_key("ran/out.txt"));
        assert!(events.iter().all(|e| match e {
            CollectProgress::Running { name, .. } => name != "skipped",
            _ => true,
        }));
    }
}
