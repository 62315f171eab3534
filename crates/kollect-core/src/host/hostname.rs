//! Host name fact.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::HostCollectorMeta;

use super::{HostCollect, SYSTEM_DIR};

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostnameInfo {
    pub hostname: String,
}

pub struct HostnameCollector {
    meta: HostCollectorMeta,
}

impl HostnameCollector {
    pub fn new(meta: HostCollectorMeta) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl HostCollect for HostnameCollector {
    fn title(&self) -> String {
        self.meta
            .collector_name
            .clone()
            .unwrap_or_else(|| "hostname".to_string())
    }

    fn kind(&self) -> &'static str {
        "hostname"
    }

    fn is_excluded(&self) -> bool {
        self.meta.exclude.unwrap_or(false)
    }

    async fn collect(&self) -> Result<CollectorResult> {
        let hostname = tokio::fs::read_to_string(HOSTNAME_PATH)
            .await
            .with_context(|| format!("reading {HOSTNAME_PATH}"))?
            .trim()
            .to_string();

        let mut result = CollectorResult::new();
        result.save_json(
            &format!("{SYSTEM_DIR}/hostname.json"),
            &HostnameInfo { hostname },
        )?;
        Ok(result)
    }
}
