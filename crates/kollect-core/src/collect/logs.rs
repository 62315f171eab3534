//! Container log streaming with line, byte, and age caps.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams};
use kube::{Api, Client};

use crate::rbac::AccessReviewRequest;
use crate::result::CollectorResult;
use crate::spec::{selector_string, LogLimits, Logs};
use crate::RunContext;

use super::progress::ProgressSink;
use super::Collect;

/// Default bound on streaming one pod's logs.
const POD_LOGS_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LogsCollector {
    spec: Logs,
    client: Client,
    ctx: Arc<RunContext>,
}

impl LogsCollector {
    pub fn new(spec: Logs, client: Client, ctx: Arc<RunContext>) -> Self {
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
            .unwrap_or_else(|| "logs".to_string())
    }

    fn pod_timeout(&self) -> Duration {
        self.spec
            .timeout
            .clone()
            .map(Into::into)
            .unwrap_or(POD_LOGS_TIMEOUT)
    }

    /// Containers to stream for one pod: the requested names, or every
    /// init and app container when unspecified.
    fn containers_for(&self, pod: &Pod) -> Vec<String> {
        if !self.spec.container_names.is_empty() {
            return self.spec.container_names.clone();
        }
        let Some(spec) = &pod.spec else {
            return Vec::new();
        };
        spec.init_containers
            .iter()
            .flatten()
            .chain(spec.containers.iter())
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Build the log subresource parameters for one stream.
///
/// The time bound takes precedence: an absolute `since_time` first, then
/// `max_age` parsed against now. Otherwise the line and byte caps (with
/// their defaults) are both enforced and whichever fires first truncates.
fn log_params(limits: Option<&LogLimits>, container: &str, previous: bool) -> LogParams {
    let mut params = LogParams {
        container: Some(container.to_string()),
        previous,
        timestamps: false,
        ..Default::default()
    };

    if let Some(since_time) = limits.and_then(|l| l.since_time) {
        let ts = k8s_openapi::jiff::Timestamp::try_from(std::time::SystemTime::from(since_time))
            .unwrap_or(k8s_openapi::jiff::Timestamp::MIN);
        params.since_time = Some(ts);
        return params;
    }
    if let Some(max_age) = limits.and_then(|l| l.max_age.clone()) {
        let age: Duration = max_age.into();
        params.since_seconds = Some(age.as_secs() as i64);
        return params;
    }

    params.tail_lines = Some(
        limits
            .and_then(|l| l.max_lines)
            .unwrap_or(LogLimits::DEFAULT_MAX_LINES),
    );
    params.limit_bytes = Some(
        limits
            .and_then(|l| l.max_bytes)
            .unwrap_or(LogLimits::DEFAULT_MAX_BYTES),
    );
    params
}

/// Output of one pod's streaming task.
struct PodLogs {
    files: Vec<(String, String)>,
    errors: Vec<String>,
}

/// Stream current and (best-effort) previous logs for every requested
/// container of one pod.
async fn save_pod_logs(
    api: &Api<Pod>,
    dir: &str,
    pod_name: &str,
    containers: &[String],
    limits: Option<&LogLimits>,
    timeout: Duration,
) -> PodLogs {
    let mut output = PodLogs {
        files: Vec::new(),
        errors: Vec::new(),
    };

    for container in containers {
        // One container name means a flat file per pod.
        let base = if containers.len() == 1 {
            format!("{dir}/{pod_name}")
        } else {
            format!("{dir}/{pod_name}/{container}")
        };

        let params = log_params(limits, container, false);
        match tokio::time::timeout(timeout, api.logs(pod_name, &params)).await {
            Ok(Ok(logs)) => output.files.push((format!("{base}.log"), logs)),
            Ok(Err(e)) => output
                .errors
                .push(format!("{pod_name}/{container}: {e}")),
            Err(_) => output
                .errors
                .push(format!("{pod_name}/{container}: log stream timed out after {timeout:?}")),
        }

        // Previous-run logs rarely exist; absence is not an error.
        let params = log_params(limits, container, true);
        if let Ok(Ok(previous)) = tokio::time::timeout(timeout, api.logs(pod_name, &params)).await {
            if !previous.is_empty() {
                output
                    .files
                    .push((format!("{base}-previous.log"), previous));
            }
        }
    }

    output
}

#[async_trait]
impl Collect for LogsCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| format!("logs/{}", self.dir_name()))
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("list", "pods", Some(self.namespace())),
            AccessReviewRequest::new("get", "pods/log", Some(self.namespace())),
        ]
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let dir = self.dir_name();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), self.namespace());
        let mut result = CollectorResult::new();

        let params = ListParams::default().labels(&selector_string(&self.spec.selector));
        let pods = match api.list(&params).await {
            Ok(listed) => listed.items,
            Err(e) => {
                result.save_errors(&dir, &[format!("listing pods: {e}")])?;
                return Ok(result);
            }
        };

        let timeout = self.pod_timeout();
        let tasks = pods.iter().filter_map(|pod| {
            let pod_name = pod.metadata.name.clone()?;
            let containers = self.containers_for(pod);
            let api = api.clone();
            let dir = dir.clone();
            let limits = self.spec.limits.clone();
            Some(async move {
                save_pod_logs(&api, &dir, &pod_name, &containers, limits.as_ref(), timeout).await
            })
        });

        let mut errors = Vec::new();
        for pod_logs in join_all(tasks).await {
            for (path, logs) in pod_logs.files {
                // Large log files stream to disk when a bundle root exists.
                result
                    .save_result(self.ctx.bundle_root(), &path, logs.as_bytes())
                    .await?;
            }
            errors.extend(pod_logs.errors);
        }

        if !errors.is_empty() {
            result.save_errors(&dir, &errors)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_params_default_caps() {
        let params = log_params(None, "app", false);
        assert_eq!(params.tail_lines, Some(LogLimits::DEFAULT_MAX_LINES));
        assert_eq!(params.limit_bytes, Some(LogLimits::DEFAULT_MAX_BYTES));
        assert!(params.since_time.is_none());
        assert!(params.since_seconds.is_none());
        assert!(!params.previous);
    }

    #[test]
    fn test_log_params_since_time_wins() {
        let limits = LogLimits {
            since_time: Some(chrono::Utc::now()),
            max_age: Some(duration_string::DurationString::from_string("1h".to_string()).unwrap()),
            max_lines: Some(5),
            max_bytes: Some(10),
        };
        let params = log_params(Some(&limits), "app", false);
        assert!(params.since_time.is_some());
        assert!(params.since_seconds.is_none());
        assert!(params.tail_lines.is_none());
        assert!(params.limit_bytes.is_none());
    }

    #[test]
    fn test_log_params_max_age_beats_line_caps() {
        let limits = LogLimits {
            since_time: None,
            max_age: Some(duration_string::DurationString::from_string("2m".to_string()).unwrap()),
            max_lines: Some(5),
            max_bytes: None,
        };
        let params = log_params(Some(&limits), "app", false);
        assert_eq!(params.since_seconds, Some(120));
        assert!(params.tail_lines.is_none());
    }

    #[tokio::test]
    async fn test_containers_fall_back_to_pod_spec() {
        use k8s_openapi::api::core::v1::{Container, PodSpec};

        let collector = LogsCollector::new(
            Logs::default(),
            crate::testutil::mock_client(|_| (http::StatusCode::OK, Vec::new())),
            Arc::new(crate::RunContext::for_tests()),
        );

        let pod = Pod {
            spec: Some(PodSpec {
                init_containers: Some(vec![Container {
                    name: "init".to_string(),
                    ..Default::default()
                }]),
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(collector.containers_for(&pod), vec!["init", "app"]);
    }
}
