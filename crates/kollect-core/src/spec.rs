//! Parsed collector spec types.
//!
//! How a spec document is loaded (YAML, CRD, flags) is the caller's
//! business; the engine consumes the ordered list of variants below. Each
//! variant carries its own configuration record and embeds the shared
//! `collector_name` / `exclude` pair read by the registry.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use duration_string::DurationString;
use k8s_openapi::api::core::v1::PodSpec;
use serde::{Deserialize, Serialize};

/// One entry of the ordered collector list.
///
/// Serialised form is a single-key map, e.g. `{"logs": {...}}`. Kinds the
/// engine does not implement deserialise into [`CollectorSpec::Other`] and
/// are reported and skipped by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectorSpec {
    ClusterInfo(ClusterInfo),
    ClusterResources(ClusterResources),
    ConfigMap(ConfigMapSpec),
    Secret(SecretSpec),
    Logs(Logs),
    Exec(ExecSpec),
    #[serde(alias = "run")]
    RunPod(RunPod),
    RunDaemonSet(RunDaemonSet),
    CopyFromHost(CopyFromHost),
    Http(HttpSpec),
    Data(DataSpec),
    #[serde(untagged)]
    Other(serde_json::Value),
}

impl CollectorSpec {
    /// Short kind tag used in progress reports for unknown variants.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectorSpec::ClusterInfo(_) => "clusterInfo",
            CollectorSpec::ClusterResources(_) => "clusterResources",
            CollectorSpec::ConfigMap(_) => "configMap",
            CollectorSpec::Secret(_) => "secret",
            CollectorSpec::Logs(_) => "logs",
            CollectorSpec::Exec(_) => "exec",
            CollectorSpec::RunPod(_) => "runPod",
            CollectorSpec::RunDaemonSet(_) => "runDaemonSet",
            CollectorSpec::CopyFromHost(_) => "copyFromHost",
            CollectorSpec::Http(_) => "http",
            CollectorSpec::Data(_) => "data",
            CollectorSpec::Other(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterInfo {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterResources {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    /// Namespaces to snapshot; empty means all namespaces.
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigMapSpec {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub namespace: Option<String>,
    /// Exact object name; mutually exclusive with `selector`.
    pub name: Option<String>,
    pub selector: Vec<String>,
    /// A single key whose value is captured when `include_value` is set.
    pub key: Option<String>,
    pub include_value: bool,
    pub include_all_data: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretSpec {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub selector: Vec<String>,
    pub key: Option<String>,
    /// Secrets omit values unless explicitly opted in.
    pub include_value: bool,
    pub include_all_data: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Logs {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    /// Directory name inside the bundle; falls back to `collector_name`.
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub selector: Vec<String>,
    /// Containers to stream; empty means every init and app container.
    pub container_names: Vec<String>,
    pub limits: Option<LogLimits>,
    pub timeout: Option<DurationString>,
}

/// Caps applied to a log stream. First non-empty wins for the time bound:
/// `since_time`, then `max_age`; otherwise `max_lines` and `max_bytes`
/// (defaulted) are both enforced and whichever fires first truncates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogLimits {
    pub since_time: Option<DateTime<Utc>>,
    pub max_age: Option<DurationString>,
    pub max_lines: Option<i64>,
    pub max_bytes: Option<i64>,
}

impl LogLimits {
    pub const DEFAULT_MAX_LINES: i64 = 10_000;
    pub const DEFAULT_MAX_BYTES: i64 = 5_000_000;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecSpec {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub selector: Vec<String>,
    pub container_name: Option<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub timeout: Option<DurationString>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunPod {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub timeout: Option<DurationString>,
    pub image_pull_secret: Option<ImagePullSecret>,
    /// Full pod spec supplied by the caller; restart policy defaults to
    /// `Never` when unset.
    pub pod_spec: Option<PodSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunDaemonSet {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub timeout: Option<DurationString>,
    pub image_pull_secret: Option<ImagePullSecret>,
    pub pod_spec: Option<PodSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CopyFromHost {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// Absolute path on each node to copy.
    pub host_path: String,
    pub image: Option<String>,
    pub image_pull_policy: Option<String>,
    pub image_pull_secret: Option<ImagePullSecret>,
    /// Unpack the per-node archive into individual files instead of
    /// storing `archive.tar` verbatim.
    pub extract_archive: bool,
    pub timeout: Option<DurationString>,
}

/// Reference to or inline definition of an image-pull secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImagePullSecret {
    pub name: Option<String>,
    /// Inline body; the `.dockerconfigjson` key holds base64 docker config.
    pub data: Option<BTreeMap<String, String>>,
    #[serde(rename = "type")]
    pub secret_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSpec {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub get: Option<HttpRequest>,
    pub post: Option<HttpRequest>,
    pub put: Option<HttpRequest>,
}

impl HttpSpec {
    /// The configured request and its method, if any single one is set.
    pub fn request(&self) -> Option<(reqwest::Method, &HttpRequest)> {
        if let Some(r) = &self.get {
            Some((reqwest::Method::GET, r))
        } else if let Some(r) = &self.post {
            Some((reqwest::Method::POST, r))
        } else {
            self.put.as_ref().map(|r| (reqwest::Method::PUT, r))
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Option<DurationString>,
    pub insecure_skip_verify: bool,
    pub tls: Option<TlsParams>,
    /// Explicit proxy URL; the standard proxy environment variables apply
    /// when unset.
    pub proxy: Option<String>,
}

/// TLS material for the HTTP probe: inline PEM text, a filesystem path, or
/// a cluster secret holding `cacert` / `clientCert` / `clientKey`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsParams {
    pub skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub secret: Option<TlsSecretRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSecretRef {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSpec {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
    pub name: Option<String>,
    pub data: String,
}

/// A host collector variant; runs on a node's host namespaces, either
/// locally or fanned out through ephemeral pods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostCollectorSpec {
    Cpu(HostCollectorMeta),
    Memory(HostCollectorMeta),
    Time(HostCollectorMeta),
    #[serde(rename = "hostOS")]
    OsInfo(HostCollectorMeta),
    BlockDevices(HostCollectorMeta),
    Hostname(HostCollectorMeta),
    #[serde(untagged)]
    Other(serde_json::Value),
}

impl HostCollectorSpec {
    /// Directory segment under `host-collectors/` for remote fan-out.
    pub fn kind(&self) -> &'static str {
        match self {
            HostCollectorSpec::Cpu(_) => "cpu",
            HostCollectorSpec::Memory(_) => "memory",
            HostCollectorSpec::Time(_) => "time",
            HostCollectorSpec::OsInfo(_) => "hostOS",
            HostCollectorSpec::BlockDevices(_) => "blockDevices",
            HostCollectorSpec::Hostname(_) => "hostname",
            HostCollectorSpec::Other(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostCollectorMeta {
    pub collector_name: Option<String>,
    pub exclude: Option<bool>,
}

/// Convert a spec timeout field into a [`Duration`].
pub fn parse_duration(s: &str) -> Result<Duration> {
    DurationString::from_string(s.to_string())
        .map(Into::into)
        .map_err(|e| anyhow!("invalid duration {s:?}: {e}"))
}

/// Join label selector terms into the API server's comma form.
pub fn selector_string(selector: &[String]) -> String {
    selector.join(",")
}
