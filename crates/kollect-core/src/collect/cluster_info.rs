//! Cluster version snapshot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::Client;
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::ClusterInfo;

use super::progress::ProgressSink;
use super::Collect;

const VERSION_PATH: &str = "cluster-info/cluster_version.json";

#[derive(Debug, Serialize)]
struct ClusterVersion<'a> {
    info: &'a k8s_openapi::apimachinery::pkg::version::Info,
    string: &'a str,
}

pub struct ClusterInfoCollector {
    spec: ClusterInfo,
    client: Client,
}

impl ClusterInfoCollector {
    pub fn new(spec: ClusterInfo, client: Client) -> Self {
        Self { spec, client }
    }
}

#[async_trait]
impl Collect for ClusterInfoCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| "cluster-info".to_string())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let info = self
            .client
            .apiserver_version()
            .await
            .context("reading apiserver version")?;

        let mut result = CollectorResult::new();
        result.save_json(
            VERSION_PATH,
            &ClusterVersion {
                info: &info,
                string: &info.git_version,
            },
        )?;
        Ok(result)
    }
}
