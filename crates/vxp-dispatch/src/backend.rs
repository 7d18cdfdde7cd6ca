// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend HTTP call and outcome classification.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;
use vxp_error::{ErrorKind, ProxyError};
use vxp_extension::ExtensionDescriptor;
use vxp_protocol::{ForgedHeaders, ReplyBody};

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// The HTTP methods the proxy forwards. Anything else is answered with `405`
/// without touching the backend. The set is fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
    /// `PATCH`
    Patch,
    /// `HEAD`
    Head,
    /// `OPTIONS`
    Options,
}

impl SupportedMethod {
    /// Parse an already-lowercased method name.
    pub fn parse(lowercased: &str) -> Option<Self> {
        match lowercased {
            "get" => Some(Self::Get),
            "post" => Some(Self::Post),
            "put" => Some(Self::Put),
            "delete" => Some(Self::Delete),
            "patch" => Some(Self::Patch),
            "head" => Some(Self::Head),
            "options" => Some(Self::Options),
            _ => None,
        }
    }

    /// The HTTP client's canonical method value.
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
            Self::Head => reqwest::Method::HEAD,
            Self::Options => reqwest::Method::OPTIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The classified result of one backend interaction: always a status code
/// and a reply body, whatever went wrong on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    /// HTTP status for the reply envelope.
    pub status: u16,
    /// Reply body (raw backend bytes, or a proxy-built JSON error).
    pub body: ReplyBody,
}

/// The canonical error body text for a reply-producing error kind.
pub fn error_body_text(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BackendTimeout => "Timeout from extension backend server",
        ErrorKind::BackendTooManyRedirects => "TooManyRedirects from extension backend server",
        ErrorKind::BackendUnreachable => "ConnectionError from the extension backend server",
        ErrorKind::BackendProtocol => "Protocol error from extension backend server",
        ErrorKind::ConfigError => "Invalid backend URL configured",
        _ => "Unexpected proxy error",
    }
}

/// Build the JSON error reply for a kind, using its mapped status.
pub fn error_response(kind: ErrorKind) -> BackendResponse {
    BackendResponse {
        status: kind.reply_status().unwrap_or(500),
        body: ReplyBody::Text(
            serde_json::json!({"Error": error_body_text(kind)}).to_string(),
        ),
    }
}

// ---------------------------------------------------------------------------
// ExtensionRuntime
// ---------------------------------------------------------------------------

/// A descriptor paired with the HTTP client configured for it.
///
/// The client carries the descriptor's timeout and TLS-verify policy;
/// connection reuse across workers is whatever the client does by default.
#[derive(Debug, Clone)]
pub struct ExtensionRuntime {
    descriptor: ExtensionDescriptor,
    client: reqwest::Client,
}

impl ExtensionRuntime {
    /// Build the runtime for one descriptor.
    pub fn new(descriptor: ExtensionDescriptor) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(descriptor.backend.timeout)
            .danger_accept_invalid_certs(!descriptor.backend.ssl_verify)
            .build()
            .map_err(|e| {
                ProxyError::new(
                    ErrorKind::ConfigError,
                    format!("cannot build HTTP client for extension '{}'", descriptor.name),
                )
                .with_source(e)
            })?;
        Ok(Self { descriptor, client })
    }

    /// The extension descriptor this runtime serves.
    pub fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }

    /// Issue the single backend request and classify the outcome.
    ///
    /// Never fails: every wire-level error is folded into a
    /// [`BackendResponse`] per the error taxonomy.
    pub async fn forward(
        &self,
        method: SupportedMethod,
        url: &str,
        headers: &ForgedHeaders,
        body: Vec<u8>,
    ) -> BackendResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers.entries() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    map.append(n, v);
                }
                _ => {
                    warn!(extension = %self.descriptor.name, header = %name,
                        "skipping envelope header that is not a valid HTTP header");
                }
            }
        }

        let mut request = self
            .client
            .request(method.as_reqwest(), url)
            .headers(map)
            .body(body);
        if let Some(auth) = self.descriptor.auth() {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.bytes().await {
                    Ok(bytes) => BackendResponse {
                        status,
                        body: ReplyBody::Bytes(bytes.to_vec()),
                    },
                    Err(e) => self.classify(e),
                }
            }
            Err(e) => self.classify(e),
        }
    }

    fn classify(&self, error: reqwest::Error) -> BackendResponse {
        let kind = if error.is_timeout() {
            ErrorKind::BackendTimeout
        } else if error.is_redirect() {
            ErrorKind::BackendTooManyRedirects
        } else if error.is_connect() {
            ErrorKind::BackendUnreachable
        } else {
            ErrorKind::BackendProtocol
        };
        warn!(extension = %self.descriptor.name, kind = %kind, error = %error,
            "backend call failed");
        error_response(kind)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
