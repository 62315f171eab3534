//! Host collectors: read the node's own filesystem and kernel surfaces.
//!
//! A host collector runs in two modes. Locally it reads `/proc`, `/sys`
//! and `/etc` directly and produces a [`CollectorResult`] under
//! `host-collectors/system/`. Remotely the dispatcher (`crate::remote`)
//! runs the same collector inside an ephemeral pod on each selected node;
//! the pod prints the result as a single JSON document on stdout which the
//! dispatcher decodes and re-homes per node.

mod block_devices;
mod cpu;
mod hostname;
mod memory;
mod os_info;
mod time;

pub use block_devices::BlockDevicesCollector;
pub use cpu::CpuCollector;
pub use hostname::HostnameCollector;
pub use memory::MemoryCollector;
pub use os_info::OsInfoCollector;
pub use time::TimeCollector;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;

use crate::result::CollectorResult;
use crate::spec::HostCollectorSpec;

/// Directory for host collector output when running locally.
pub const SYSTEM_DIR: &str = "host-collectors/system";

/// Uniform contract for host collectors.
#[async_trait]
pub trait HostCollect: Send + Sync {
    /// Short, stable human label used in progress reports.
    fn title(&self) -> String;

    /// Directory segment under `host-collectors/` for remote fan-out.
    fn kind(&self) -> &'static str;

    fn is_excluded(&self) -> bool;

    /// Gather the node-local facts into a result tree.
    async fn collect(&self) -> Result<CollectorResult>;
}

/// Resolve a host collector spec to a concrete collector.
///
/// Unknown variants return `None`; the caller reports and skips them.
pub fn make_host_collector(spec: &HostCollectorSpec) -> Option<Box<dyn HostCollect>> {
    match spec {
        HostCollectorSpec::Cpu(meta) => Some(Box::new(CpuCollector::new(meta.clone()))),
        HostCollectorSpec::Memory(meta) => Some(Box::new(MemoryCollector::new(meta.clone()))),
        HostCollectorSpec::Time(meta) => Some(Box::new(TimeCollector::new(meta.clone()))),
        HostCollectorSpec::OsInfo(meta) => Some(Box::new(OsInfoCollector::new(meta.clone()))),
        HostCollectorSpec::BlockDevices(meta) => {
            Some(Box::new(BlockDevicesCollector::new(meta.clone())))
        }
        HostCollectorSpec::Hostname(meta) => Some(Box::new(HostnameCollector::new(meta.clone()))),
        HostCollectorSpec::Other(_) => None,
    }
}

/// Run a host collector locally and encode its result on the remote wire
/// format: a JSON object mapping each relative path to base64 bytes.
///
/// This is what the runner container executes and prints to stdout.
pub async fn run_local_to_wire(spec: &HostCollectorSpec) -> Result<String> {
    let collector = make_host_collector(spec)
        .with_context(|| format!("unknown host collector kind {:?}", spec.kind()))?;
    let result = collector.collect().await?;
    encode_wire(&result).await
}

/// Encode a result as the remote wire document.
pub async fn encode_wire(result: &CollectorResult) -> Result<String> {
    let mut wire: BTreeMap<String, String> = BTreeMap::new();
    for (key, _) in result.entries() {
        let data = result.get_bytes(key).await?;
        wire.insert(
            key.to_string(),
            base64::engine::general_purpose::STANDARD.encode(&data),
        );
    }
    Ok(serde_json::to_string(&wire)?)
}

/// Decode a remote wire document back into (path, bytes) pairs.
pub fn decode_wire(document: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let wire: BTreeMap<String, String> =
        serde_json::from_str(document).context("parsing host collector wire document")?;
    let mut entries = Vec::with_capacity(wire.len());
    for (path, encoded) in wire {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .with_context(|| format!("decoding wire entry {path}"))?;
        entries.push((path, data));
    }
    Ok(entries)
}
