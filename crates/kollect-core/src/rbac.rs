//! Access-review preflighting.
//!
//! Before any collector runs, the orchestrator submits one
//! self-subject-access-review per distinct operation the collector list
//! declares. Denied operations are bucketed per collector; whether the run
//! aborts or continues without them is the orchestrator's call, based on
//! the run context.

use std::collections::{HashMap, HashSet};
use std::fmt;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use serde::Serialize;

use crate::error::CollectError;

/// One operation a collector needs the cluster to allow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AccessReviewRequest {
    pub verb: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub group: Option<String>,
    pub version: Option<String>,
}

impl AccessReviewRequest {
    pub fn new(verb: &str, resource: &str, namespace: Option<&str>) -> Self {
        Self {
            verb: verb.to_string(),
            resource: resource.to_string(),
            namespace: namespace.map(str::to_string),
            group: None,
            version: None,
        }
    }
}

/// A denied operation attributed to the collector that declared it.
#[derive(Debug, Clone, Serialize)]
pub struct RbacError {
    pub display_name: String,
    pub namespace: Option<String>,
    pub resource: String,
    pub verb: String,
}

impl fmt::Display for RbacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(
                f,
                "{}: cannot {} {} in namespace {}",
                self.display_name, self.verb, self.resource, ns
            ),
            None => write!(
                f,
                "{}: cannot {} {}",
                self.display_name, self.verb, self.resource
            ),
        }
    }
}

/// Outcome of the preflight phase.
#[derive(Debug, Default)]
pub struct PreflightReport {
    /// Union of all denied operations, attributed per collector.
    pub forbidden: Vec<RbacError>,
    /// Titles of collectors with at least one denied operation.
    pub excluded_titles: HashSet<String>,
}

impl PreflightReport {
    pub fn is_clean(&self) -> bool {
        self.forbidden.is_empty()
    }
}

/// Submit a single self-subject-access-review and report whether the
/// operation is allowed. A submission error is fatal ([`CollectError::ClusterUnavailable`]).
pub async fn review_access(
    client: &Client,
    request: &AccessReviewRequest,
) -> Result<bool, CollectError> {
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                verb: Some(request.verb.clone()),
                resource: Some(request.resource.clone()),
                namespace: request.namespace.clone(),
                group: request.group.clone(),
                version: request.version.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let api: Api<SelfSubjectAccessReview> = Api::all(client.clone());
    let created = api
        .create(&PostParams::default(), &review)
        .await
        .map_err(CollectError::ClusterUnavailable)?;

    Ok(created.status.map(|s| s.allowed).unwrap_or(false))
}

/// Preflight every collector's declared operations.
///
/// Distinct operations are reviewed once; the verdict is fanned back to
/// every collector that declared the operation.
pub async fn preflight(
    client: &Client,
    declared: &[(String, Vec<AccessReviewRequest>)],
) -> Result<PreflightReport, CollectError> {
    let mut verdicts: HashMap<AccessReviewRequest, bool> = HashMap::new();
    for (_, requests) in declared {
        for request in requests {
            if verdicts.contains_key(request) {
                continue;
            }
            let allowed = review_access(client, request).await?;
            if !allowed {
                tracing::warn!(
                    verb = %request.verb,
                    resource = %request.resource,
                    namespace = request.namespace.as_deref().unwrap_or("<cluster>"),
                    "access review denied"
                );
            }
            verdicts.insert(request.clone(), allowed);
        }
    }

    let mut report = PreflightReport::default();
    for (title, requests) in declared {
        for request in requests {
            if verdicts.get(request).copied().unwrap_or(false) {
                continue;
            }
            report.forbidden.push(RbacError {
                display_name: title.clone(),
                namespace: request.namespace.clone(),
                resource: request.resource.clone(),
                verb: request.verb.clone(),
            });
            report.excluded_titles.insert(title.clone());
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_client;

    fn allowed_body(allowed: bool) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SelfSubjectAccessReview",
            "spec": {},
            "status": {"allowed": allowed}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_preflight_buckets_denials_per_collector() {
        // Every review is denied.
        let client = mock_client(|_req| (http::StatusCode::CREATED, allowed_body(false)));

        let declared = vec![
            (
                "cluster-resources".to_string(),
                vec![
                    AccessReviewRequest::new("list", "pods", Some("default")),
                    AccessReviewRequest::new("list", "nodes", None),
                ],
            ),
            (
                "app-logs".to_string(),
                vec![AccessReviewRequest::new("get", "pods/log", Some("default"))],
            ),
        ];

        let report = preflight(&client, &declared).await.unwrap();
        assert_eq!(report.forbidden.len(), 3);
        assert!(report.excluded_titles.contains("cluster-resources"));
        assert!(report.excluded_titles.contains("app-logs"));
    }

    #[tokio::test]
    async fn test_preflight_clean_when_all_allowed() {
        let client = mock_client(|_req| (http::StatusCode::CREATED, allowed_body(true)));

        let declared = vec![(
            "cluster-resources".to_string(),
            vec![AccessReviewRequest::new("list", "pods", Some("default"))],
        )];

        let report = preflight(&client, &declared).await.unwrap();
        assert!(report.is_clean());
        assert!(report.excluded_titles.is_empty());
    }
}
