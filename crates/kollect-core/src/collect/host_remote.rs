//! Host collectors surfaced through the in-cluster collector contract.
//!
//! Wraps a host collector spec and a node selector so the orchestration
//! loop can drive node fan-out like any other collector.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kube::Client;

use crate::host::make_host_collector;
use crate::rbac::AccessReviewRequest;
use crate::remote;
use crate::result::CollectorResult;
use crate::spec::HostCollectorSpec;
use crate::RunContext;

use super::progress::ProgressSink;
use super::Collect;

pub struct RemoteHostCollector {
    spec: HostCollectorSpec,
    node_selector: Vec<String>,
    client: Client,
    ctx: Arc<RunContext>,
}

/// Resolve a host collector spec into a remote fan-out collector.
///
/// Unknown host variants return `None`, mirroring the in-cluster
/// registry.
pub fn make_remote_collector(
    spec: HostCollectorSpec,
    node_selector: Vec<String>,
    client: Client,
    ctx: Arc<RunContext>,
) -> Option<Box<dyn Collect>> {
    // Probe the host registry so unknown kinds are declined up front.
    make_host_collector(&spec)?;
    Some(Box::new(RemoteHostCollector {
        spec,
        node_selector,
        client,
        ctx,
    }))
}

#[async_trait]
impl Collect for RemoteHostCollector {
    fn title(&self) -> String {
        format!("host/{}", self.spec.kind())
    }

    fn is_excluded(&self) -> Result<bool> {
        let excluded = make_host_collector(&self.spec)
            .map(|c| c.is_excluded())
            .unwrap_or(true);
        Ok(excluded)
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("list", "nodes", None),
            AccessReviewRequest::new("create", "pods", Some(&self.ctx.namespace)),
            AccessReviewRequest::new("delete", "pods", Some(&self.ctx.namespace)),
            AccessReviewRequest::new("get", "pods/log", Some(&self.ctx.namespace)),
        ]
    }

    async fn collect(&self, progress: &dyn ProgressSink) -> Result<CollectorResult> {
        remote::dispatch_host_collector(
            &self.client,
            &self.ctx,
            progress,
            &self.spec,
            &self.node_selector,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::HostCollectorMeta;

    fn ctx() -> Arc<RunContext> {
        Arc::new(crate::RunContext::for_tests())
    }

    fn client() -> Client {
        crate::testutil::mock_client(|_| (http::StatusCode::OK, Vec::new()))
    }

    #[tokio::test]
    async fn test_unknown_host_kind_is_declined() {
        let spec = HostCollectorSpec::Other(serde_json::json!({"tcpPortStatus": {}}));
        assert!(make_remote_collector(spec, Vec::new(), client(), ctx()).is_none());
    }

    #[tokio::test]
    async fn test_known_host_kind_titles() {
        let spec = HostCollectorSpec::Cpu(HostCollectorMeta::default());
        let collector = make_remote_collector(spec, Vec::new(), client(), ctx()).unwrap();
        assert_eq!(collector.title(), "host/cpu");
        assert!(!collector.is_excluded().unwrap());
    }

    #[tokio::test]
    async fn test_zero_matching_nodes_is_empty_and_non_fatal() {
        use crate::collect::progress::ChannelProgress;

        let client = crate::testutil::mock_client(|req| {
            assert!(req.uri().path().ends_with("/nodes"));
            (
                http::StatusCode::OK,
                crate::testutil::empty_list_body("Node"),
            )
        });
        let spec = HostCollectorSpec::Cpu(HostCollectorMeta::default());
        let collector = make_remote_collector(spec, vec!["role=worker".to_string()], client, ctx())
            .unwrap();

        let (sink, mut rx) = ChannelProgress::new();
        let result = collector.collect(&sink).await.unwrap();
        assert!(result.is_empty());

        drop(sink);
        let warning = rx.try_recv().unwrap();
        assert!(matches!(
            warning,
            crate::collect::progress::CollectProgress::Warning { .. }
        ));
    }
}
