//! Kollect Core - Collection engine for cluster support bundles
//!
//! This crate contains the engine that turns an ordered collector spec
//! into a support bundle, including:
//! - Collector result accumulation (streaming file tree, symlinks)
//! - Access-review preflighting
//! - Pod-exec streaming over the exec subresource
//! - Ephemeral workload lifecycle (secrets, pods, daemon-sets)
//! - Per-node host collector fan-out
//! - The orchestration loop driving the collector list
//!
//! Loading specs from YAML and rendering progress are the caller's
//! business; the engine consumes parsed [`spec::CollectorSpec`] values and
//! emits [`CollectProgress`] records through a caller-supplied sink.

pub mod collect;
pub mod error;
pub mod exec;
pub mod host;
pub mod rbac;
pub mod remote;
pub mod result;
pub mod spec;
pub mod workload;

#[cfg(test)]
pub(crate) mod testutil;

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use collect::progress::{ChannelProgress, CollectProgress, NoOpProgress, ProgressSink};
pub use collect::{make_collector, merge_specs, Collect, Orchestrator};
pub use error::CollectError;
pub use result::{CollectorResult, ResultData};

/// Default bound on one collection run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Process-wide configuration for one collection run.
///
/// Shared read-only by every collector; the engine never consults ambient
/// state (kubeconfig, environment) on its own.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Namespace used when a collector spec omits one.
    pub namespace: String,
    /// Local filesystem root for large-file streaming; `None` keeps all
    /// output in memory.
    pub bundle_path: Option<PathBuf>,
    /// Hard deadline for the whole run.
    pub timeout: Duration,
    /// Image run inside ephemeral pods for host fan-out.
    pub runner_image: String,
    pub image_pull_policy: String,
    /// Continue past access-review denials, excluding the affected
    /// collectors, instead of failing the run.
    pub allow_partial: bool,
    /// Ambient cancellation signal; one cancel tears the whole run down.
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(namespace: impl Into<String>, runner_image: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            bundle_path: None,
            timeout: DEFAULT_TIMEOUT,
            runner_image: runner_image.into(),
            image_pull_policy: "IfNotPresent".to_string(),
            allow_partial: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_bundle_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundle_path = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    /// Bundle root as a borrowed path for the result accumulator.
    pub fn bundle_root(&self) -> Option<&std::path::Path> {
        self.bundle_path.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new("default", "kollect/runner:test").with_timeout(Duration::from_secs(5))
    }
}
