// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-message request worker.
//!
//! A worker is created for one delivery, runs to completion, and exits.
//! Whatever happens on the way (unsupported method, unusable URL, backend
//! failure) it produces a reply outcome; only the publisher decides whether
//! that outcome can actually be addressed back to the requester.

use crate::backend::{self, BackendResponse, ExtensionRuntime, SupportedMethod};
use crate::precheck::PreCheck;
use tracing::{debug, error, warn};
use vxp_error::{ErrorKind, ProxyError};
use vxp_protocol::{ForgedHeaders, InboundEnvelope, ReplyBody};

/// What a finished worker hands to the reply publisher.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Request id echoed from the envelope.
    pub id: String,
    /// The request's `Accept` header, if any.
    pub accept: Option<String>,
    /// HTTP status for the reply envelope.
    pub status: u16,
    /// Reply body.
    pub body: ReplyBody,
}

/// Run one request to completion.
pub async fn execute(
    runtime: &ExtensionRuntime,
    envelope: &InboundEnvelope,
    precheck: &dyn PreCheck,
) -> WorkerOutcome {
    let extension = &runtime.descriptor().name;
    let id = envelope.request.id.clone();
    let accept = envelope.request.accept().map(str::to_string);

    let response = match dispatch(runtime, envelope, precheck).await {
        Ok(response) => response,
        Err(err) => {
            error!(extension = %extension, request_id = %id, error = %err,
                "request worker failed");
            backend::error_response(err.kind)
        }
    };
    debug!(extension = %extension, request_id = %id, status = response.status,
        "request worker finished");

    WorkerOutcome {
        id,
        accept,
        status: response.status,
        body: response.body,
    }
}

async fn dispatch(
    runtime: &ExtensionRuntime,
    envelope: &InboundEnvelope,
    precheck: &dyn PreCheck,
) -> Result<BackendResponse, ProxyError> {
    let descriptor = runtime.descriptor();
    let request = &envelope.request;

    let headers = ForgedHeaders::forge(request, &envelope.context)?;

    let method_name = request.method.to_ascii_lowercase();
    let Some(method) = SupportedMethod::parse(&method_name) else {
        warn!(extension = %descriptor.name, method = %method_name,
            "unsupported method");
        return Ok(BackendResponse {
            status: 405,
            body: ReplyBody::Text(
                serde_json::json!({
                    "Error": format!("The method {method_name} is not supported.")
                })
                .to_string(),
            ),
        });
    };

    let url = descriptor.backend_url(&request.request_uri, request.query_string.as_deref())?;
    let body = request.body_bytes()?;

    if !precheck.check(envelope, descriptor).await {
        return Err(ProxyError::new(
            ErrorKind::Internal,
            "pre-check refused the request",
        ));
    }

    debug!(extension = %descriptor.name, url = %url, method = %method_name,
        "forwarding request to backend");
    Ok(runtime.forward(method, &url, &headers, body).await)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precheck::AllowAll;
    use async_trait::async_trait;
    use vxp_config::Registry;
    use vxp_extension::ExtensionDescriptor;
    use vxp_protocol::{ExtensionRequest, RequestContext};

    const ORG: &str = "urn:vcloud:org:11111111-1111-1111-1111-111111111111";
    const USER: &str = "urn:vcloud:user:22222222-2222-2222-2222-222222222222";

    fn runtime(endpoint: &str) -> ExtensionRuntime {
        let config = format!(
            r#"
[extensions.demo.amqp]
routing_key = "ext.demo"

[extensions.demo.amqp.exchange]
name = "vcdext"

[extensions.demo.amqp.queue]
name = "demo-q"

[extensions.demo.backend]
endpoint = "{endpoint}"
timeout = 2
"#
        );
        let registry = Registry::from_toml_str(&config).unwrap();
        ExtensionRuntime::new(ExtensionDescriptor::from_registry(&registry, "demo").unwrap())
            .unwrap()
    }

    fn envelope(method: &str) -> InboundEnvelope {
        let mut request = ExtensionRequest::default();
        request.id = "req-1".to_string();
        request.method = method.to_string();
        request.request_uri = "/things".to_string();
        InboundEnvelope {
            request,
            context: RequestContext {
                org: ORG.to_string(),
                user: USER.to_string(),
                rights: vec!["R1".to_string()],
            },
        }
    }

    struct DenyAll;

    #[async_trait]
    impl PreCheck for DenyAll {
        async fn check(&self, _e: &InboundEnvelope, _d: &ExtensionDescriptor) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn unsupported_method_short_circuits() {
        // Endpoint is unreachable on purpose: a 405 must never touch it.
        let rt = runtime("http://127.0.0.1:1/api");
        let outcome = execute(&rt, &envelope("FROBNICATE"), &AllowAll).await;
        assert_eq!(outcome.status, 405);
        let parsed: serde_json::Value =
            serde_json::from_slice(outcome.body.as_bytes()).unwrap();
        assert_eq!(parsed["Error"], "The method frobnicate is not supported.");
    }

    #[tokio::test]
    async fn unusable_url_is_config_error() {
        let rt = runtime("no-scheme-here");
        let outcome = execute(&rt, &envelope("GET"), &AllowAll).await;
        assert_eq!(outcome.status, 500);
        let parsed: serde_json::Value =
            serde_json::from_slice(outcome.body.as_bytes()).unwrap();
        assert_eq!(parsed["Error"], "Invalid backend URL configured");
    }

    #[tokio::test]
    async fn unreachable_backend_is_503() {
        let rt = runtime("http://127.0.0.1:1/api");
        let outcome = execute(&rt, &envelope("GET"), &AllowAll).await;
        assert_eq!(outcome.status, 503);
        let parsed: serde_json::Value =
            serde_json::from_slice(outcome.body.as_bytes()).unwrap();
        assert_eq!(parsed["Error"], "ConnectionError from the extension backend server");
    }

    #[tokio::test]
    async fn malformed_context_is_internal() {
        let rt = runtime("http://127.0.0.1:1/api");
        let mut env = envelope("GET");
        env.context.org = "not-a-urn".to_string();
        let outcome = execute(&rt, &env, &AllowAll).await;
        assert_eq!(outcome.status, 500);
    }

    #[tokio::test]
    async fn precheck_refusal_is_internal() {
        let rt = runtime("http://127.0.0.1:1/api");
        let outcome = execute(&rt, &envelope("GET"), &DenyAll).await;
        assert_eq!(outcome.status, 500);
    }

    #[tokio::test]
    async fn happy_path_forwards_headers_and_body() {
        use base64::Engine as _;
        use wiremock::matchers::{body_bytes, header, method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/things"))
            .and(query_param("a", "1"))
            .and(header("org_id", "11111111-1111-1111-1111-111111111111"))
            .and(header("user_id", "22222222-2222-2222-2222-222222222222"))
            .and(header("user_rights", r#"["R1"]"#))
            .and(body_bytes(b"hello".to_vec()))
            .respond_with(ResponseTemplate::new(201).set_body_bytes(b"made".to_vec()))
            .mount(&server)
            .await;

        let rt = runtime(&server.uri());
        let mut env = envelope("POST");
        env.request.request_uri = "/api/things".to_string();
        env.request.query_string = Some("a=1".to_string());
        env.request.body = base64::engine::general_purpose::STANDARD.encode(b"hello");

        let outcome = execute(&rt, &env, &AllowAll).await;
        assert_eq!(outcome.status, 201);
        assert_eq!(outcome.body.as_bytes(), b"made");
    }

    #[tokio::test]
    async fn slow_backend_is_504() {
        use wiremock::matchers::any;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        // Descriptor timeout is 2 s (see `runtime`).
        let rt = runtime(&server.uri());
        let outcome = execute(&rt, &envelope("GET"), &AllowAll).await;
        assert_eq!(outcome.status, 504);
        let parsed: serde_json::Value =
            serde_json::from_slice(outcome.body.as_bytes()).unwrap();
        assert_eq!(parsed["Error"], "Timeout from extension backend server");
    }

    #[tokio::test]
    async fn outcome_echoes_id_and_accept() {
        let rt = runtime("http://127.0.0.1:1/api");
        let mut env = envelope("GET");
        env.request
            .headers
            .insert("Accept".to_string(), "application/json".to_string());
        let outcome = execute(&rt, &env, &AllowAll).await;
        assert_eq!(outcome.id, "req-1");
        assert_eq!(outcome.accept.as_deref(), Some("application/json"));
    }
}
