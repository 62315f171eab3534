//! Host memory facts from `/proc/meminfo`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::HostCollectorMeta;

use super::{HostCollect, SYSTEM_DIR};

const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    /// Total physical memory in bytes.
    pub total: u64,
}

pub struct MemoryCollector {
    meta: HostCollectorMeta,
}

impl MemoryCollector {
    pub fn new(meta: HostCollectorMeta) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl HostCollect for MemoryCollector {
    fn title(&self) -> String {
        self.meta
            .collector_name
            .clone()
            .unwrap_or_else(|| "memory".to_string())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn is_excluded(&self) -> bool {
        self.meta.exclude.unwrap_or(false)
    }

    async fn collect(&self) -> Result<CollectorResult> {
        let raw = tokio::fs::read_to_string(MEMINFO_PATH)
            .await
            .with_context(|| format!("reading {MEMINFO_PATH}"))?;
        let info = parse_meminfo(&raw)?;

        let mut result = CollectorResult::new();
        result.save_json(&format!("{SYSTEM_DIR}/memory.json"), &info)?;
        Ok(result)
    }
}

fn parse_meminfo(raw: &str) -> Result<MemoryInfo> {
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "MemTotal" {
            continue;
        }
        // Format: "MemTotal:       16384256 kB"
        let kb: u64 = value
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse()
            .with_context(|| format!("parsing MemTotal from {value:?}"))?;
        return Ok(MemoryInfo { total: kb * 1024 });
    }
    anyhow::bail!("MemTotal not present in meminfo")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let raw = "MemTotal:       16384256 kB\nMemFree:         8123456 kB\n";
        let info = parse_meminfo(raw).unwrap();
        assert_eq!(info.total, 16384256 * 1024);
    }

    #[test]
    fn test_parse_meminfo_missing_total() {
        assert!(parse_meminfo("MemFree: 1 kB\n").is_err());
    }
}
