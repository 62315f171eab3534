//! Host block device inventory from `/sys/block`.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::HostCollectorMeta;

use super::{HostCollect, SYSTEM_DIR};

const SYS_BLOCK_PATH: &str = "/sys/block";

/// Sector size used by the kernel for the `size` attribute.
const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    pub name: String,
    /// Device size in bytes.
    pub size: u64,
    pub read_only: bool,
}

pub struct BlockDevicesCollector {
    meta: HostCollectorMeta,
}

impl BlockDevicesCollector {
    pub fn new(meta: HostCollectorMeta) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl HostCollect for BlockDevicesCollector {
    fn title(&self) -> String {
        self.meta
            .collector_name
            .clone()
            .unwrap_or_else(|| "block-devices".to_string())
    }

    fn kind(&self) -> &'static str {
        "blockDevices"
    }

    fn is_excluded(&self) -> bool {
        self.meta.exclude.unwrap_or(false)
    }

    async fn collect(&self) -> Result<CollectorResult> {
        let devices = list_block_devices(Path::new(SYS_BLOCK_PATH)).await?;

        let mut result = CollectorResult::new();
        result.save_json(&format!("{SYSTEM_DIR}/block_devices.json"), &devices)?;
        Ok(result)
    }
}

async fn list_block_devices(sys_block: &Path) -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();
    let mut dir = tokio::fs::read_dir(sys_block)
        .await
        .with_context(|| format!("reading {}", sys_block.display()))?;

    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let sectors = read_u64(&entry.path().join("size")).await.unwrap_or(0);
        let read_only = read_u64(&entry.path().join("ro")).await.unwrap_or(0) != 0;
        devices.push(BlockDevice {
            name,
            size: sectors * SECTOR_SIZE,
            read_only,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

async fn read_u64(path: &Path) -> Option<u64> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_block_devices_from_fixture_tree() {
        let root = tempfile::tempdir().unwrap();
        for (name, sectors, ro) in [("sda", "1024", "0"), ("loop0", "64", "1")] {
            let dir = root.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("size"), sectors).unwrap();
            std::fs::write(dir.join("ro"), ro).unwrap();
        }

        let devices = list_block_devices(root.path()).await.unwrap();
        assert_eq!(devices.len(), 2);
        // Sorted by name.
        assert_eq!(devices[0].name, "loop0");
        assert_eq!(devices[0].size, 64 * SECTOR_SIZE);
        assert!(devices[0].read_only);
        assert_eq!(devices[1].name, "sda");
        assert_eq!(devices[1].size, 1024 * SECTOR_SIZE);
        assert!(!devices[1].read_only);
    }
}
