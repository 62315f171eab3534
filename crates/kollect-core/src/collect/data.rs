//! Verbatim data collector: records caller-supplied content in the bundle.

use anyhow::Result;
use async_trait::async_trait;

use crate::result::CollectorResult;
use crate::spec::DataSpec;

use super::progress::ProgressSink;
use super::Collect;

pub struct DataCollector {
    spec: DataSpec,
}

impl DataCollector {
    pub fn new(spec: DataSpec) -> Self {
        Self { spec }
    }

    fn file_path(&self) -> String {
        let file = self.spec.name.as_deref().unwrap_or("data");
        match self.spec.collector_name.as_deref() {
            Some(dir) if !dir.is_empty() => format!("{dir}/{file}"),
            _ => file.to_string(),
        }
    }
}

#[async_trait]
impl Collect for DataCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| "data".to_string())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let mut result = CollectorResult::new();
        result.save_bytes(&self.file_path(), self.spec.data.clone().into_bytes())?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::progress::NoOpProgress;

    #[tokio::test]
    async fn test_data_lands_under_collector_dir() {
        let collector = DataCollector::new(DataSpec {
            collector_name: Some("static".to_string()),
            name: Some("notes.txt".to_string()),
            data: "hello".to_string(),
            ..Default::default()
        });

        let result = collector.collect(&NoOpProgress).await.unwrap();
        let data = result.get_bytes("static/notes.txt").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }
}
