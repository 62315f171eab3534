//! Host OS release and kernel facts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::HostCollectorMeta;

use super::{HostCollect, SYSTEM_DIR};

const OS_RELEASE_PATH: &str = "/etc/os-release";
const KERNEL_RELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    pub name: String,
    pub id: String,
    pub version_id: String,
    pub kernel_version: String,
}

pub struct OsInfoCollector {
    meta: HostCollectorMeta,
}

impl OsInfoCollector {
    pub fn new(meta: HostCollectorMeta) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl HostCollect for OsInfoCollector {
    fn title(&self) -> String {
        self.meta
            .collector_name
            .clone()
            .unwrap_or_else(|| "os-info".to_string())
    }

    fn kind(&self) -> &'static str {
        "hostOS"
    }

    fn is_excluded(&self) -> bool {
        self.meta.exclude.unwrap_or(false)
    }

    async fn collect(&self) -> Result<CollectorResult> {
        let release = tokio::fs::read_to_string(OS_RELEASE_PATH)
            .await
            .with_context(|| format!("reading {OS_RELEASE_PATH}"))?;
        let mut info = parse_os_release(&release);
        info.kernel_version = tokio::fs::read_to_string(KERNEL_RELEASE_PATH)
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let mut result = CollectorResult::new();
        result.save_json(&format!("{SYSTEM_DIR}/hostos_info.json"), &info)?;
        Ok(result)
    }
}

fn parse_os_release(raw: &str) -> OsInfo {
    let mut info = OsInfo::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "NAME" => info.name = value,
            "ID" => info.id = value,
            "VERSION_ID" => info.version_id = value,
            _ => {}
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let raw = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\nPRETTY_NAME=\"Ubuntu 22.04\"\n";
        let info = parse_os_release(raw);
        assert_eq!(info.name, "Ubuntu");
        assert_eq!(info.id, "ubuntu");
        assert_eq!(info.version_id, "22.04");
    }

    #[test]
    fn test_parse_os_release_empty() {
        let info = parse_os_release("");
        assert!(info.name.is_empty());
    }
}
