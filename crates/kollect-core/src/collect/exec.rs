//! Run a command in every selected pod and capture its output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use crate::exec::{exec_in_pod, ExecRequest};
use crate::rbac::AccessReviewRequest;
use crate::result::CollectorResult;
use crate::spec::{selector_string, ExecSpec};
use crate::RunContext;

use super::progress::ProgressSink;
use super::Collect;

pub struct ExecCollector {
    spec: ExecSpec,
    client: Client,
    ctx: Arc<RunContext>,
}

/// Captured output of the whole fan-out; wrapper collectors re-home the
/// per-pod stdout under their own file names.
pub struct ExecOutcome {
    pub result: CollectorResult,
    pub stdout_by_pod: BTreeMap<String, Vec<u8>>,
}

impl ExecCollector {
    pub fn new(spec: ExecSpec, client: Client, ctx: Arc<RunContext>) -> Self {
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
            .unwrap_or_else(|| "exec".to_string())
    }

    fn command(&self) -> Vec<String> {
        self.spec
            .command
            .iter()
            .chain(self.spec.args.iter())
            .cloned()
            .collect()
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout.clone().map(Into::into)
    }

    /// Run the command on every matching pod and write the canonical
    /// three files per pod.
    pub async fn run(&self) -> Result<ExecOutcome> {
        let dir = self.dir_name();
        let ns = self.namespace().to_string();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &ns);
        let mut outcome = ExecOutcome {
            result: CollectorResult::new(),
            stdout_by_pod: BTreeMap::new(),
        };

        let params = ListParams::default().labels(&selector_string(&self.spec.selector));
        let pods = match api.list(&params).await {
            Ok(listed) => listed.items,
            Err(e) => {
                outcome
                    .result
                    .save_errors(&dir, &[format!("listing pods: {e}")])?;
                return Ok(outcome);
            }
        };

        let command = self.command();
        let tasks = pods.iter().filter_map(|pod| {
            let pod_name = pod.metadata.name.clone()?;
            let request = ExecRequest {
                namespace: ns.clone(),
                pod: pod_name.clone(),
                container: self.spec.container_name.clone(),
                command: command.clone(),
                timeout: self.timeout(),
            };
            let client = self.client.clone();
            let cancel = self.ctx.cancel.clone();
            Some(async move { (pod_name, exec_in_pod(&client, &cancel, &request).await) })
        });

        for (pod_name, output) in join_all(tasks).await {
            match output {
                Ok(output) => {
                    let errors: Vec<String> = output.error_message().into_iter().collect();
                    outcome
                        .result
                        .save_bytes(&format!("{dir}/{pod_name}-stdout.txt"), output.stdout.clone())?;
                    outcome
                        .result
                        .save_bytes(&format!("{dir}/{pod_name}-stderr.txt"), output.stderr)?;
                    outcome
                        .result
                        .save_json(&format!("{dir}/{pod_name}-errors.json"), &errors)?;
                    outcome.stdout_by_pod.insert(pod_name, output.stdout);
                }
                Err(e) => {
                    outcome
                        .result
                        .save_json(&format!("{dir}/{pod_name}-errors.json"), &vec![e.to_string()])?;
                }
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl Collect for ExecCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| format!("exec/{}", self.dir_name()))
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("list", "pods", Some(self.namespace())),
            AccessReviewRequest::new("create", "pods/exec", Some(self.namespace())),
        ]
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        Ok(self.run().await?.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_concatenates_args() {
        let collector = ExecCollector::new(
            ExecSpec {
                command: vec!["sh".to_string(), "-c".to_string()],
                args: vec!["date".to_string()],
                ..Default::default()
            },
            crate::testutil::mock_client(|_| (http::StatusCode::OK, Vec::new())),
            Arc::new(crate::RunContext::for_tests()),
        );
        assert_eq!(collector.command(), vec!["sh", "-c", "date"]);
    }

    #[tokio::test]
    async fn test_list_failure_writes_selector_error() {
        let collector = ExecCollector::new(
            ExecSpec {
                name: Some("diag".to_string()),
                selector: vec!["app=x".to_string()],
                ..Default::default()
            },
            crate::testutil::mock_client(|_| {
                (
                    http::StatusCode::FORBIDDEN,
                    crate::testutil::not_found_body("pods", "any"),
                )
            }),
            Arc::new(crate::RunContext::for_tests()),
        );

        let outcome = collector.run().await.unwrap();
        let errs = outcome.result.get_bytes("diag/errors.json").await.unwrap();
        let parsed: Vec<String> = serde_json::from_slice(&errs).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].contains("listing pods"));
    }
}
