//! Typed error kinds surfaced by the collection engine.
//!
//! Collector bodies use `anyhow` for plumbing; the kinds below are the ones
//! callers and the orchestrator dispatch on.

use std::time::Duration;

use thiserror::Error;

use crate::rbac::RbacError;

/// Errors produced by the engine core.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The spec contained an unknown variant or a missing required field.
    #[error("invalid collector spec: {0}")]
    SpecInvalid(String),

    /// The access-review preflight denied one or more required operations
    /// and the run context does not permit partial collection.
    #[error("insufficient permissions to run all collectors: {}", fmt_denials(.0))]
    InsufficientPermissions(Vec<RbacError>),

    /// The cluster API itself was unreachable.
    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(#[source] kube::Error),

    /// The per-collector or per-bundle deadline fired.
    #[error("collector timed out after {0:?}")]
    CollectorTimeout(Duration),

    /// A pod referenced a host path that does not exist on the node.
    #[error("host path missing for pod {pod}: {message}")]
    HostPathMissing { pod: String, message: String },

    /// The runner image could not be pulled.
    #[error("image pull failed for pod {pod}: {message}")]
    ImagePullFailed { pod: String, message: String },

    /// The container runtime could not create the pod sandbox.
    #[error("sandbox creation failed for pod {pod}: {message}")]
    SandboxCreationFailed { pod: String, message: String },

    /// A pod-exec stream exceeded its deadline; partial output was kept.
    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),

    /// A pod-exec command terminated with a failure status.
    #[error("exec failed: {0}")]
    ExecFailed(String),

    /// A filesystem error while streaming into the bundle tree.
    #[error("bundle io error")]
    Io(#[from] std::io::Error),

    /// Every node of a host fan-out failed; carries the first failure.
    #[error("all {nodes} nodes failed; first error: {first}")]
    AllNodesFailed { nodes: usize, first: String },

    /// The ambient cancellation signal fired.
    #[error("collection cancelled")]
    Cancelled,
}

fn fmt_denials(denials: &[RbacError]) -> String {
    denials
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_permissions_display() {
        let err = CollectError::InsufficientPermissions(vec![
            RbacError {
                display_name: "cluster-resources".to_string(),
                namespace: Some("default".to_string()),
                resource: "pods".to_string(),
                verb: "list".to_string(),
            },
            RbacError {
                display_name: "node-list".to_string(),
                namespace: None,
                resource: "nodes".to_string(),
                verb: "list".to_string(),
            },
        ]);

        let msg = err.to_string();
        assert!(msg.contains("cluster-resources"));
        assert!(msg.contains("list nodes"));
    }
}
