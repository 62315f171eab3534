//! Kubernetes resource snapshotters.
//!
//! Selector- or name-driven reads serialised one document per object under
//! a kind-scoped directory. Named lookups that miss produce a sentinel
//! document plus an error side file instead of failing the collector.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Node, Pod, Secret, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use serde::Serialize;

use crate::rbac::AccessReviewRequest;
use crate::result::CollectorResult;
use crate::spec::{selector_string, ClusterResources, ConfigMapSpec, SecretSpec};
use crate::RunContext;

use super::progress::ProgressSink;
use super::Collect;

const CONFIGMAPS_DIR: &str = "configmaps";
const CONFIGMAPS_ERRORS_DIR: &str = "configmaps-errors";
const SECRETS_DIR: &str = "secrets";
const SECRETS_ERRORS_DIR: &str = "secrets-errors";
const CLUSTER_RESOURCES_DIR: &str = "cluster-resources";

// ---------------------------------------------------------------------------
// ConfigMap
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMapOutput {
    namespace: String,
    name: String,
    key: String,
    config_map_exists: bool,
    key_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<BTreeMap<String, String>>,
}

pub struct ConfigMapCollector {
    spec: ConfigMapSpec,
    client: Client,
    ctx: Arc<RunContext>,
}

impl ConfigMapCollector {
    pub fn new(spec: ConfigMapSpec, client: Client, ctx: Arc<RunContext>) -> Self {
        Self { spec, client, ctx }
    }

    fn namespace(&self) -> &str {
        self.spec
            .namespace
            .as_deref()
            .unwrap_or(&self.ctx.namespace)
    }

    fn output(&self, cm: &ConfigMap) -> ConfigMapOutput {
        let key = self.spec.key.clone().unwrap_or_default();
        let value = cm.data.as_ref().and_then(|d| d.get(&key)).cloned();
        let key_exists = !key.is_empty() && value.is_some();

        ConfigMapOutput {
            namespace: self.namespace().to_string(),
            name: cm.metadata.name.clone().unwrap_or_default(),
            key: key.clone(),
            config_map_exists: true,
            key_exists,
            value: if self.spec.include_value && key_exists {
                value
            } else {
                None
            },
            data: if self.spec.include_all_data {
                cm.data.clone()
            } else {
                None
            },
        }
    }
}

#[async_trait]
impl Collect for ConfigMapCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| "configmap".to_string())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("get", "configmaps", Some(self.namespace())),
            AccessReviewRequest::new("list", "configmaps", Some(self.namespace())),
        ]
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let ns = self.namespace().to_string();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &ns);
        let mut result = CollectorResult::new();

        if let Some(name) = &self.spec.name {
            match api.get(name).await {
                Ok(cm) => {
                    result.save_json(&format!("{CONFIGMAPS_DIR}/{ns}/{name}.json"), &self.output(&cm))?;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    let sentinel = ConfigMapOutput {
                        namespace: ns.clone(),
                        name: name.clone(),
                        key: self.spec.key.clone().unwrap_or_default(),
                        config_map_exists: false,
                        key_exists: false,
                        value: None,
                        data: None,
                    };
                    result.save_json(&format!("{CONFIGMAPS_DIR}/{ns}/{name}.json"), &sentinel)?;
                    result.save_json(
                        &format!("{CONFIGMAPS_ERRORS_DIR}/{ns}/{name}.json"),
                        &vec![e.message],
                    )?;
                }
                Err(e) => return Err(e).with_context(|| format!("reading configmap {ns}/{name}")),
            }
            return Ok(result);
        }

        let params = ListParams::default().labels(&selector_string(&self.spec.selector));
        let listed = api
            .list(&params)
            .await
            .with_context(|| format!("listing configmaps in {ns}"))?;
        for cm in &listed.items {
            let name = cm.metadata.name.clone().unwrap_or_default();
            result.save_json(&format!("{CONFIGMAPS_DIR}/{ns}/{name}.json"), &self.output(cm))?;
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretOutput {
    namespace: String,
    name: String,
    key: String,
    secret_exists: bool,
    key_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

pub struct SecretCollector {
    spec: SecretSpec,
    client: Client,
    ctx: Arc<RunContext>,
}

impl SecretCollector {
    pub fn new(spec: SecretSpec, client: Client, ctx: Arc<RunContext>) -> Self {
        Self { spec, client, ctx }
    }

    fn namespace(&self) -> &str {
        self.spec
            .namespace
            .as_deref()
            .unwrap_or(&self.ctx.namespace)
    }

    fn output(&self, secret: &Secret) -> SecretOutput {
        let key = self.spec.key.clone().unwrap_or_default();
        let raw = secret.data.as_ref().and_then(|d| d.get(&key));
        let key_exists = !key.is_empty() && raw.is_some();

        // Values stay out of the bundle unless explicitly opted in.
        let value = if self.spec.include_value && key_exists {
            raw.map(|b| String::from_utf8_lossy(&b.0).to_string())
        } else {
            None
        };

        SecretOutput {
            namespace: self.namespace().to_string(),
            name: secret.metadata.name.clone().unwrap_or_default(),
            key,
            secret_exists: true,
            key_exists,
            value,
        }
    }
}

#[async_trait]
impl Collect for SecretCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| "secret".to_string())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        vec![
            AccessReviewRequest::new("get", "secrets", Some(self.namespace())),
            AccessReviewRequest::new("list", "secrets", Some(self.namespace())),
        ]
    }

    fn skip_redaction(&self) -> bool {
        // Output is already value-free unless the caller opted in.
        !self.spec.include_value
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let ns = self.namespace().to_string();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &ns);
        let mut result = CollectorResult::new();

        if let Some(name) = &self.spec.name {
            match api.get(name).await {
                Ok(secret) => {
                    result.save_json(&format!("{SECRETS_DIR}/{ns}/{name}.json"), &self.output(&secret))?;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    let sentinel = SecretOutput {
                        namespace: ns.clone(),
                        name: name.clone(),
                        key: self.spec.key.clone().unwrap_or_default(),
                        secret_exists: false,
                        key_exists: false,
                        value: None,
                    };
                    result.save_json(&format!("{SECRETS_DIR}/{ns}/{name}.json"), &sentinel)?;
                    result.save_json(
                        &format!("{SECRETS_ERRORS_DIR}/{ns}/{name}.json"),
                        &vec![e.message],
                    )?;
                }
                Err(e) => return Err(e).with_context(|| format!("reading secret {ns}/{name}")),
            }
            return Ok(result);
        }

        let params = ListParams::default().labels(&selector_string(&self.spec.selector));
        let listed = api
            .list(&params)
            .await
            .with_context(|| format!("listing secrets in {ns}"))?;
        for secret in &listed.items {
            let name = secret.metadata.name.clone().unwrap_or_default();
            result.save_json(&format!("{SECRETS_DIR}/{ns}/{name}.json"), &self.output(secret))?;
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Cluster resources
// ---------------------------------------------------------------------------

pub struct ClusterResourcesCollector {
    spec: ClusterResources,
    client: Client,
}

impl ClusterResourcesCollector {
    pub fn new(spec: ClusterResources, client: Client) -> Self {
        Self { spec, client }
    }

    async fn target_namespaces(&self) -> Result<Vec<String>> {
        if !self.spec.namespaces.is_empty() {
            return Ok(self.spec.namespaces.clone());
        }
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let listed = namespaces
            .list(&ListParams::default())
            .await
            .context("listing namespaces")?;
        Ok(listed
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn snapshot_namespaced<K>(
        &self,
        kind_dir: &str,
        ns: &str,
        result: &mut CollectorResult,
        errors: &mut Vec<String>,
    ) where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + Serialize
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        match api.list(&ListParams::default()).await {
            Ok(listed) => {
                if let Err(e) = result.save_json(
                    &format!("{CLUSTER_RESOURCES_DIR}/{kind_dir}/{ns}.json"),
                    &listed.items,
                ) {
                    errors.push(format!("{kind_dir}/{ns}: {e}"));
                }
            }
            Err(e) => errors.push(format!("{kind_dir}/{ns}: {e}")),
        }
    }
}

#[async_trait]
impl Collect for ClusterResourcesCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| "cluster-resources".to_string())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    fn access_requests(&self) -> Vec<AccessReviewRequest> {
        let mut requests = vec![
            AccessReviewRequest::new("list", "namespaces", None),
            AccessReviewRequest::new("list", "nodes", None),
        ];
        for resource in ["pods", "services", "deployments", "events"] {
            if self.spec.namespaces.is_empty() {
                requests.push(AccessReviewRequest::new("list", resource, None));
            } else {
                for ns in &self.spec.namespaces {
                    requests.push(AccessReviewRequest::new("list", resource, Some(ns)));
                }
            }
        }
        requests
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let mut result = CollectorResult::new();
        let mut errors = Vec::new();

        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.list(&ListParams::default()).await {
            Ok(listed) => {
                result.save_json(&format!("{CLUSTER_RESOURCES_DIR}/nodes.json"), &listed.items)?;
            }
            Err(e) => errors.push(format!("nodes: {e}")),
        }

        let namespaces = match self.target_namespaces().await {
            Ok(namespaces) => {
                result.save_json(
                    &format!("{CLUSTER_RESOURCES_DIR}/namespaces.json"),
                    &namespaces,
                )?;
                namespaces
            }
            Err(e) => {
                errors.push(format!("namespaces: {e}"));
                Vec::new()
            }
        };

        for ns in &namespaces {
            self.snapshot_namespaced::<Pod>("pods", ns, &mut result, &mut errors)
                .await;
            self.snapshot_namespaced::<Service>("services", ns, &mut result, &mut errors)
                .await;
            self.snapshot_namespaced::<Deployment>("deployments", ns, &mut result, &mut errors)
                .await;
            self.snapshot_namespaced::<Event>("events", ns, &mut result, &mut errors)
                .await;
        }

        if !errors.is_empty() {
            result.save_errors(CLUSTER_RESOURCES_DIR, &errors)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::progress::NoOpProgress;
    use crate::testutil::{mock_client, not_found_body};

    fn collector_for(name: &str) -> ConfigMapCollector {
        let client = mock_client(|req| {
            assert_eq!(req.method(), http::Method::GET);
            (
                http::StatusCode::NOT_FOUND,
                not_found_body("configmaps", "missing"),
            )
        });
        ConfigMapCollector::new(
            ConfigMapSpec {
                namespace: Some("ns".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            client,
            Arc::new(crate::RunContext::for_tests()),
        )
    }

    #[tokio::test]
    async fn test_missing_configmap_writes_sentinel_and_error() {
        let collector = collector_for("missing");
        let result = collector.collect(&NoOpProgress).await.unwrap();

        let doc = result.get_bytes("configmaps/ns/missing.json").await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&doc).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!({
                "namespace": "ns",
                "name": "missing",
                "key": "",
                "configMapExists": false,
                "keyExists": false
            })
        );

        let errs = result
            .get_bytes("configmaps-errors/ns/missing.json")
            .await
            .unwrap();
        let parsed: Vec<String> = serde_json::from_slice(&errs).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].contains("not found"));
    }

    #[tokio::test]
    async fn test_secret_output_omits_value_by_default() {
        let secret = Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("creds".to_string()),
                ..Default::default()
            },
            data: Some(std::collections::BTreeMap::from([(
                "password".to_string(),
                k8s_openapi::ByteString(b"hunter2".to_vec()),
            )])),
            ..Default::default()
        };

        let client = mock_client(|_req| (http::StatusCode::OK, Vec::new()));
        let collector = SecretCollector::new(
            SecretSpec {
                namespace: Some("ns".to_string()),
                name: Some("creds".to_string()),
                key: Some("password".to_string()),
                ..Default::default()
            },
            client,
            Arc::new(crate::RunContext::for_tests()),
        );

        let output = collector.output(&secret);
        assert!(output.secret_exists);
        assert!(output.key_exists);
        assert!(output.value.is_none());
        assert!(collector.skip_redaction());
    }
}
