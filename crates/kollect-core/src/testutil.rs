//! Shared test helpers: a `kube::Client` served by an in-process closure.

use kube::client::Body;
use kube::Client;

/// Build a client whose every request is answered by `handler`.
///
/// The handler receives the outgoing request (method, URI, headers) and
/// returns the response status plus a JSON body.
pub fn mock_client<F>(handler: F) -> Client
where
    F: Fn(&http::Request<Body>) -> (http::StatusCode, Vec<u8>) + Clone + Send + Sync + 'static,
{
    let service = tower::service_fn(move |req: http::Request<Body>| {
        let handler = handler.clone();
        async move {
            let (status, body) = handler(&req);
            let response = http::Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap();
            Ok::<_, std::convert::Infallible>(response)
        }
    });
    Client::new(service, "default")
}

/// A canonical `NotFound` status body for a named resource.
pub fn not_found_body(kind: &str, name: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "apiVersion": "v1",
        "kind": "Status",
        "status": "Failure",
        "message": format!("{kind} \"{name}\" not found"),
        "reason": "NotFound",
        "code": 404
    }))
    .unwrap()
}

/// An empty typed list body for list endpoints.
pub fn empty_list_body(kind: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "apiVersion": "v1",
        "kind": format!("{kind}List"),
        "metadata": {"resourceVersion": "1"},
        "items": []
    }))
    .unwrap()
}
