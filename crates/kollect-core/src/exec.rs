//! Bidirectional command channel into a running container.
//!
//! Binds to the cluster's exec subresource with stdin and tty disabled and
//! both output streams enabled. Stdout and stderr are read concurrently;
//! each stream's bytes are preserved in arrival order, with no cross-stream
//! ordering guarantee.

use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::CollectError;

/// A command to run inside a (namespace, pod, container).
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub command: Vec<String>,
    pub timeout: Option<Duration>,
}

/// Captured output of one exec invocation.
///
/// `error` is `None` on exit-zero. On timeout the partial output received
/// so far is retained alongside [`CollectError::ExecTimeout`]. An empty
/// stderr is stored as empty bytes, indistinguishable from a missing one.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<CollectError>,
}

impl ExecOutput {
    /// The error message for the collector's error file, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// Open the exec channel, drain both streams, and wait for the command's
/// termination status.
///
/// A transport-level failure (the subresource could not be opened at all)
/// is returned as `Err`; command failure and timeout are reported inside
/// [`ExecOutput::error`].
pub async fn exec_in_pod(
    client: &Client,
    cancel: &CancellationToken,
    request: &ExecRequest,
) -> Result<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &request.namespace);

    let mut params = AttachParams::default()
        .stdin(false)
        .stdout(true)
        .stderr(true)
        .tty(false);
    if let Some(container) = &request.container {
        params = params.container(container.clone());
    }

    let mut attached = pods
        .exec(&request.pod, request.command.clone(), &params)
        .await
        .with_context(|| format!("opening exec channel into pod {}", request.pod))?;

    let mut stdout = attached.stdout().context("exec channel has no stdout")?;
    let mut stderr = attached.stderr().context("exec channel has no stderr")?;
    let status = attached.take_status().context("exec status already taken")?;

    let mut output = ExecOutput::default();
    let deadline = request.timeout.map(|t| tokio::time::Instant::now() + t);

    let mut stdout_buf = [0u8; 8192];
    let mut stderr_buf = [0u8; 8192];
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            read = stdout.read(&mut stdout_buf), if !stdout_done => match read {
                Ok(0) => stdout_done = true,
                Ok(n) => output.stdout.extend_from_slice(&stdout_buf[..n]),
                Err(e) => {
                    tracing::debug!(pod = %request.pod, error = %e, "exec stdout closed");
                    stdout_done = true;
                }
            },
            read = stderr.read(&mut stderr_buf), if !stderr_done => match read {
                Ok(0) => stderr_done = true,
                Ok(n) => output.stderr.extend_from_slice(&stderr_buf[..n]),
                Err(e) => {
                    tracing::debug!(pod = %request.pod, error = %e, "exec stderr closed");
                    stderr_done = true;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                if deadline.is_some() =>
            {
                output.error = Some(CollectError::ExecTimeout(
                    request.timeout.unwrap_or_default(),
                ));
                return Ok(output);
            }
            _ = cancel.cancelled() => {
                output.error = Some(CollectError::Cancelled);
                return Ok(output);
            }
        }
    }

    // Both streams closed; the termination status follows.
    if let Some(status) = status.await {
        if status.status.as_deref() == Some("Failure") {
            let message = status
                .message
                .unwrap_or_else(|| "command failed".to_string());
            output.error = Some(CollectError::ExecFailed(message));
        }
    }

    Ok(output)
}
