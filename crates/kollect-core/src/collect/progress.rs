//! Progress reporting for a collection run.

use serde::Serialize;
use tokio::sync::mpsc;

/// A progress record emitted while the orchestrator drives the collector
/// list. `completed` counts collectors finished so far out of `total`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CollectProgress {
    /// A collector started.
    Running {
        name: String,
        completed: usize,
        total: usize,
    },
    /// A collector finished and its result was merged.
    Completed {
        name: String,
        completed: usize,
        total: usize,
    },
    /// A collector failed; the run continues.
    Failed {
        name: String,
        error: String,
        completed: usize,
        total: usize,
    },
    /// Free-form warning (skipped variants, denied access, node failures).
    Warning { message: String },
}

impl CollectProgress {
    pub fn warning(message: impl Into<String>) -> Self {
        CollectProgress::Warning {
            message: message.into(),
        }
    }
}

/// Trait for receiving progress records during a collection run.
///
/// Implement this trait to surface progress to a UI or log stream.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, progress: CollectProgress);
}

/// No-op implementation for testing and headless callers.
pub struct NoOpProgress;

impl ProgressSink for NoOpProgress {
    fn emit(&self, _progress: CollectProgress) {}
}

/// Channel-backed sink; drops records if the receiver lags behind.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<CollectProgress>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CollectProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn emit(&self, progress: CollectProgress) {
        let _ = self.tx.send(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_progress_delivery() {
        let (sink, mut rx) = ChannelProgress::new();

        sink.emit(CollectProgress::Running {
            name: "logs".to_string(),
            completed: 0,
            total: 2,
        });
        sink.emit(CollectProgress::warning("node fan-out matched nothing"));

        match rx.recv().await.unwrap() {
            CollectProgress::Running { name, total, .. } => {
                assert_eq!(name, "logs");
                assert_eq!(total, 2);
            }
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            CollectProgress::Warning { .. }
        ));
    }

    #[test]
    fn test_progress_serialises_with_status_tag() {
        let record = CollectProgress::Failed {
            name: "exec".to_string(),
            error: "timed out".to_string(),
            completed: 1,
            total: 3,
        };
        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["status"], "failed");
        assert_eq!(doc["name"], "exec");
        assert_eq!(doc["error"], "timed out");
    }
}
