//! Canonical HTTP probe.
//!
//! One GET/POST/PUT per spec entry. The probe never fails the collector:
//! transport errors become an `{"error": ...}` document in the bundle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::Serialize;

use crate::result::CollectorResult;
use crate::spec::{HttpRequest, HttpSpec, TlsParams};
use crate::RunContext;

use super::progress::ProgressSink;
use super::Collect;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ResponseDoc {
    response: ResponseBody,
}

#[derive(Debug, Serialize)]
struct ResponseBody {
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
    /// Body decoded as JSON, or an empty object when it is not JSON.
    raw_json: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ErrorDoc {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub struct HttpCollector {
    spec: HttpSpec,
    client: Client,
    ctx: Arc<RunContext>,
}

impl HttpCollector {
    pub fn new(spec: HttpSpec, client: Client, ctx: Arc<RunContext>) -> Self {
        Self { spec, client, ctx }
    }

    fn file_name(&self) -> String {
        let name = self
            .spec
            .collector_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or("result");
        format!("{name}.json")
    }

    async fn execute(&self, method: reqwest::Method, request: &HttpRequest) -> Result<ResponseDoc> {
        let timeout = match &request.timeout {
            Some(t) => t.clone().into(),
            None => DEFAULT_TIMEOUT,
        };

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if request.insecure_skip_verify
            || request.tls.as_ref().map(|t| t.skip_verify).unwrap_or(false)
        {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(tls) = &request.tls {
            builder = self.apply_tls(builder, tls).await?;
        }
        if let Some(proxy) = &request.proxy {
            builder =
                builder.proxy(reqwest::Proxy::all(proxy.as_str()).context("invalid proxy url")?);
        }
        let http = builder.build().context("building http client")?;

        let mut outgoing = http.request(method, request.url.as_str());
        for (key, value) in &request.headers {
            outgoing = outgoing.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            outgoing = outgoing.body(body.clone());
        }

        let response = outgoing.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .fold(BTreeMap::<String, String>::new(), |mut acc, (k, v)| {
                let value = String::from_utf8_lossy(v.as_bytes()).to_string();
                acc.entry(k.to_string())
                    .and_modify(|joined| {
                        joined.push_str(", ");
                        joined.push_str(&value);
                    })
                    .or_insert(value);
                acc
            });
        let body = response.text().await.unwrap_or_default();
        let raw_json = serde_json::from_str(&body)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));

        Ok(ResponseDoc {
            response: ResponseBody {
                status,
                headers,
                body,
                raw_json,
            },
        })
    }

    /// Assemble TLS material from inline PEM, filesystem paths, or a
    /// cluster secret holding `cacert` / `clientCert` / `clientKey`.
    async fn apply_tls(
        &self,
        mut builder: reqwest::ClientBuilder,
        tls: &TlsParams,
    ) -> Result<reqwest::ClientBuilder> {
        let (ca_cert, client_cert, client_key) = match &tls.secret {
            Some(secret_ref) => self.tls_from_secret(secret_ref).await?,
            None => (
                tls.ca_cert.clone(),
                tls.client_cert.clone(),
                tls.client_key.clone(),
            ),
        };

        if let Some(ca) = &ca_cert {
            for pem in load_ca_material(ca).await? {
                builder = builder.add_root_certificate(
                    reqwest::Certificate::from_pem(pem.as_bytes()).context("parsing CA cert")?,
                );
            }
        }

        match (&client_cert, &client_key) {
            (Some(cert), Some(key)) => {
                let identity = reqwest::Identity::from_pem(format!("{cert}\n{key}").as_bytes())
                    .context("parsing client identity")?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => bail!("client cert and client key must be supplied together"),
        }

        Ok(builder)
    }

    async fn tls_from_secret(
        &self,
        secret_ref: &crate::spec::TlsSecretRef,
    ) -> Result<(Option<String>, Option<String>, Option<String>)> {
        let ns = secret_ref
            .namespace
            .as_deref()
            .unwrap_or(&self.ctx.namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        let secret = secrets
            .get(&secret_ref.name)
            .await
            .with_context(|| format!("reading tls secret {ns}/{}", secret_ref.name))?;

        let data = secret.data.unwrap_or_default();
        let field = |key: &str| {
            data.get(key)
                .map(|b| String::from_utf8_lossy(&b.0).to_string())
        };

        let ca_cert = field("cacert");
        if ca_cert.is_none() {
            bail!("tls secret {ns}/{} has no cacert key", secret_ref.name);
        }
        let client_cert = field("clientCert");
        let client_key = field("clientKey");
        match (&client_cert, &client_key) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!(
                "tls secret {ns}/{} must carry both clientCert and clientKey or neither",
                secret_ref.name
            ),
        }

        Ok((ca_cert, client_cert, client_key))
    }
}

/// Interpret a CA value: inline PEM text is used as-is; a path to a file
/// is read; a path to a directory has its `*.pem` / `*.crt` entries read.
async fn load_ca_material(value: &str) -> Result<Vec<String>> {
    if value.contains("-----BEGIN") {
        return Ok(vec![value.to_string()]);
    }

    let path = Path::new(value);
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("CA value is neither PEM nor a readable path: {value}"))?;

    if meta.is_file() {
        let pem = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading CA file {value}"))?;
        return Ok(vec![pem]);
    }

    let mut pems = Vec::new();
    let mut dir = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("reading CA directory {value}"))?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".pem") || name.ends_with(".crt") {
            pems.push(tokio::fs::read_to_string(entry.path()).await?);
        }
    }
    if pems.is_empty() {
        bail!("CA directory {value} holds no .pem or .crt files");
    }
    Ok(pems)
}

#[async_trait]
impl Collect for HttpCollector {
    fn title(&self) -> String {
        self.spec
            .collector_name
            .clone()
            .unwrap_or_else(|| "http".to_string())
    }

    fn is_excluded(&self) -> Result<bool> {
        Ok(self.spec.exclude.unwrap_or(false))
    }

    async fn collect(&self, _progress: &dyn ProgressSink) -> Result<CollectorResult> {
        let mut result = CollectorResult::new();

        let Some((method, request)) = self.spec.request() else {
            result.save_json(
                &self.file_name(),
                &ErrorDoc {
                    error: ErrorBody {
                        message: "http collector has no get, post, or put request".to_string(),
                    },
                },
            )?;
            return Ok(result);
        };

        match self.execute(method, request).await {
            Ok(doc) => result.save_json(&self.file_name(), &doc)?,
            Err(e) => result.save_json(
                &self.file_name(),
                &ErrorDoc {
                    error: ErrorBody {
                        message: format!("{e:#}"),
                    },
                },
            )?,
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::progress::NoOpProgress;
    use crate::spec::HttpRequest;

    /// Serve one canned HTTP response on a local listener.
    async fn one_shot_server(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    fn collector(url: String) -> HttpCollector {
        HttpCollector::new(
            HttpSpec {
                collector_name: Some("probe".to_string()),
                get: Some(HttpRequest {
                    url,
                    timeout: Some(
                        duration_string::DurationString::from_string("5s".to_string()).unwrap(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            },
            crate::testutil::mock_client(|_| (http::StatusCode::OK, Vec::new())),
            Arc::new(crate::RunContext::for_tests()),
        )
    }

    #[tokio::test]
    async fn test_success_document_shape() {
        let url = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}",
        )
        .await;

        let result = collector(url).collect(&NoOpProgress).await.unwrap();
        let doc = result.get_bytes("probe.json").await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&doc).unwrap();

        assert_eq!(parsed["response"]["status"], 200);
        assert_eq!(parsed["response"]["body"], "{\"ok\":true}");
        assert_eq!(parsed["response"]["raw_json"]["ok"], true);
        assert_eq!(
            parsed["response"]["headers"]["content-type"],
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_network_failure_becomes_error_document() {
        // Nothing listens on this port.
        let result = collector("http://127.0.0.1:9/".to_string())
            .collect(&NoOpProgress)
            .await
            .unwrap();

        let doc = result.get_bytes("probe.json").await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&doc).unwrap();
        assert!(parsed.get("response").is_none());
        assert!(parsed["error"]["message"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_non_json_body_yields_empty_raw_json() {
        let url = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nplain",
        )
        .await;

        let result = collector(url).collect(&NoOpProgress).await.unwrap();
        let doc = result.get_bytes("probe.json").await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&doc).unwrap();
        assert_eq!(parsed["response"]["body"], "plain");
        assert_eq!(parsed["response"]["raw_json"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_inline_pem_is_used_verbatim() {
        let pems = load_ca_material("-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----")
            .await
            .unwrap();
        assert_eq!(pems.len(), 1);
    }
}
