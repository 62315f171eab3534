//! Host clock and timezone facts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::HostCollectorMeta;

use super::{HostCollect, SYSTEM_DIR};

const LOCALTIME_PATH: &str = "/etc/localtime";
const TIMEZONE_PATH: &str = "/etc/timezone";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInfo {
    pub timezone: String,
    /// Node wall-clock at collection time, RFC 3339 UTC.
    pub now: String,
}

pub struct TimeCollector {
    meta: HostCollectorMeta,
}

impl TimeCollector {
    pub fn new(meta: HostCollectorMeta) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl HostCollect for TimeCollector {
    fn title(&self) -> String {
        self.meta
            .collector_name
            .clone()
            .unwrap_or_else(|| "time".to_string())
    }

    fn kind(&self) -> &'static str {
        "time"
    }

    fn is_excluded(&self) -> bool {
        self.meta.exclude.unwrap_or(false)
    }

    async fn collect(&self) -> Result<CollectorResult> {
        let timezone = read_timezone().await;
        let info = TimeInfo {
            timezone,
            now: Utc::now().to_rfc3339(),
        };

        let mut result = CollectorResult::new();
        result.save_json(&format!("{SYSTEM_DIR}/time.json"), &info)?;
        Ok(result)
    }
}

/// Prefer the `/etc/timezone` name; fall back to the `/etc/localtime`
/// symlink target, then UTC.
async fn read_timezone() -> String {
    if let Ok(name) = tokio::fs::read_to_string(TIMEZONE_PATH).await {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Ok(target) = tokio::fs::read_link(LOCALTIME_PATH).await {
        if let Some(name) = timezone_from_link(&target.to_string_lossy()) {
            return name;
        }
    }
    "UTC".to_string()
}

fn timezone_from_link(target: &str) -> Option<String> {
    target
        .split_once("zoneinfo/")
        .map(|(_, zone)| zone.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timezone_from_link() {
        assert_eq!(
            timezone_from_link("/usr/share/zoneinfo/Europe/Berlin").as_deref(),
            Some("Europe/Berlin")
        );
        assert!(timezone_from_link("/etc/something-else").is_none());
    }
}
