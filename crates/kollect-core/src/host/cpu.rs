//! Host CPU facts from `/proc/cpuinfo`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::HostCollectorMeta;

use super::{HostCollect, SYSTEM_DIR};

const CPUINFO_PATH: &str = "/proc/cpuinfo";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub logical_cpu_count: usize,
    pub physical_cpu_count: usize,
    pub vendor: Option<String>,
    pub model_name: Option<String>,
}

pub struct CpuCollector {
    meta: HostCollectorMeta,
}

impl CpuCollector {
    pub fn new(meta: HostCollectorMeta) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl HostCollect for CpuCollector {
    fn title(&self) -> String {
        self.meta
            .collector_name
            .clone()
            .unwrap_or_else(|| "cpu".to_string())
    }

    fn kind(&self) -> &'static str {
        "cpu"
    }

    fn is_excluded(&self) -> bool {
        self.meta.exclude.unwrap_or(false)
    }

    async fn collect(&self) -> Result<CollectorResult> {
        let raw = tokio::fs::read_to_string(CPUINFO_PATH)
            .await
            .with_context(|| format!("reading {CPUINFO_PATH}"))?;
        let info = parse_cpuinfo(&raw);

        let mut result = CollectorResult::new();
        result.save_json(&format!("{SYSTEM_DIR}/cpu.json"), &info)?;
        Ok(result)
    }
}

/// Count logical processors and distinct physical packages.
fn parse_cpuinfo(raw: &str) -> CpuInfo {
    let mut logical = 0usize;
    let mut physical_ids = std::collections::BTreeSet::new();
    let mut vendor = None;
    let mut model_name = None;

    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "processor" => logical += 1,
            "physical id" => {
                physical_ids.insert(value.to_string());
            }
            "vendor_id" if vendor.is_none() => vendor = Some(value.to_string()),
            "model name" if model_name.is_none() => model_name = Some(value.to_string()),
            _ => {}
        }
    }

    CpuInfo {
        logical_cpu_count: logical,
        // Single-socket machines often omit physical ids.
        physical_cpu_count: physical_ids.len().max(usize::from(logical > 0)),
        vendor,
        model_name,
    }
}
