// SPDX-License-Identifier: MIT OR Apache-2.0
//! Envelope wire model for the vCD extension proxy.
//!
//! vCloud Director serializes every inbound extension request into a JSON
//! array of exactly two objects, `[request, context]`, and expects the reply
//! as a single JSON object `{id, headers, statusCode, body}` with a
//! base64-encoded body.  This crate owns both shapes plus the lifting rules
//! that turn the vCD context into backend request headers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vxp_error::{ErrorKind, ProxyError};

/// Content type used in reply envelopes when none is supplied.
pub const DEFAULT_REPLY_CONTENT_TYPE: &str = "application/*+json;version=31.0";

/// URN prefix carried by `context.org`.
pub const ORG_URN_PREFIX: &str = "urn:vcloud:org:";

/// URN prefix carried by `context.user`.
pub const USER_URN_PREFIX: &str = "urn:vcloud:user:";

// ---------------------------------------------------------------------------
// Inbound envelope
// ---------------------------------------------------------------------------

/// The serialized HTTP request half of an inbound envelope.
///
/// Unknown fields are ignored; vCD adds fields across API versions.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRequest {
    /// Opaque request identifier, echoed in the reply envelope.
    #[serde(default)]
    pub id: String,
    /// HTTP method name as sent by the requester (any casing).
    #[serde(default)]
    pub method: String,
    /// Request URI path, e.g. `/api/ext/things`.
    #[serde(default)]
    pub request_uri: String,
    /// Raw query string without the leading `?`, if any.
    #[serde(default)]
    pub query_string: Option<String>,
    /// Request headers, case preserved.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64-encoded request body. Empty string means empty body.
    #[serde(default)]
    pub body: String,
}

impl ExtensionRequest {
    /// Decode the base64 request body into raw bytes.
    pub fn body_bytes(&self) -> Result<Vec<u8>, ProxyError> {
        if self.body.is_empty() {
            return Ok(Vec::new());
        }
        BASE64.decode(&self.body).map_err(|e| {
            ProxyError::new(ErrorKind::Internal, "request body is not valid base64").with_source(e)
        })
    }

    /// The request's `Accept` header, looked up case-insensitively.
    pub fn accept(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("accept"))
            .map(|(_, v)| v.as_str())
    }
}

/// The vCD caller context half of an inbound envelope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequestContext {
    /// Organization URN, `urn:vcloud:org:<uuid>`.
    #[serde(default)]
    pub org: String,
    /// User URN, `urn:vcloud:user:<uuid>`.
    #[serde(default)]
    pub user: String,
    /// Rights granted to the caller.
    #[serde(default)]
    pub rights: Vec<String>,
}

impl RequestContext {
    /// The bare organization UUID (URN suffix).
    pub fn org_id(&self) -> Result<&str, ProxyError> {
        urn_suffix(&self.org, ORG_URN_PREFIX)
    }

    /// The bare user UUID (URN suffix).
    pub fn user_id(&self) -> Result<&str, ProxyError> {
        urn_suffix(&self.user, USER_URN_PREFIX)
    }
}

fn urn_suffix<'a>(urn: &'a str, prefix: &str) -> Result<&'a str, ProxyError> {
    urn.strip_prefix(prefix).ok_or_else(|| {
        ProxyError::new(
            ErrorKind::Internal,
            format!("malformed URN '{urn}', expected prefix '{prefix}'"),
        )
    })
}

/// A parsed inbound envelope: the two-element tuple `[request, context]`.
#[derive(Debug, Clone, Default)]
pub struct InboundEnvelope {
    /// The serialized HTTP request.
    pub request: ExtensionRequest,
    /// The vCD caller context.
    pub context: RequestContext,
}

impl<'de> Deserialize<'de> for InboundEnvelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (request, context) = <(ExtensionRequest, RequestContext)>::deserialize(deserializer)?;
        Ok(Self { request, context })
    }
}

impl InboundEnvelope {
    /// Parse an envelope from raw delivery bytes.
    pub fn parse(payload: &[u8]) -> Result<Self, ProxyError> {
        serde_json::from_slice(payload).map_err(|e| {
            ProxyError::new(ErrorKind::ParseError, "delivery payload is not a valid envelope")
                .with_source(e)
        })
    }
}

// ---------------------------------------------------------------------------
// Header forging
// ---------------------------------------------------------------------------

/// Headers to send to the backend, derived from the envelope.
///
/// Built from `request.headers` with any `Content-Length` stripped (the
/// upstream value is unreliable; the HTTP client recomputes it), plus the
/// lifted vCD context: `org_id`, `user_id` and `user_rights`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgedHeaders {
    entries: Vec<(String, String)>,
    /// The caller's auth token, found case-insensitively under
    /// `x-vcloud-authorization` or `authorization`. Informational; the header
    /// itself is forwarded untouched among `entries`.
    pub auth_token: Option<String>,
}

impl ForgedHeaders {
    /// Forge the backend headers for one envelope.
    pub fn forge(request: &ExtensionRequest, context: &RequestContext) -> Result<Self, ProxyError> {
        let mut entries: Vec<(String, String)> = Vec::with_capacity(request.headers.len() + 3);
        let mut auth_token = None;
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if name.eq_ignore_ascii_case("x-vcloud-authorization")
                || name.eq_ignore_ascii_case("authorization")
            {
                auth_token = Some(value.clone());
            }
            entries.push((name.clone(), value.clone()));
        }
        entries.push(("org_id".to_string(), context.org_id()?.to_string()));
        entries.push(("user_id".to_string(), context.user_id()?.to_string()));
        let rights = serde_json::to_string(&context.rights).map_err(|e| {
            ProxyError::new(ErrorKind::Internal, "rights are not JSON-serializable").with_source(e)
        })?;
        entries.push(("user_rights".to_string(), rights));
        Ok(Self { entries, auth_token })
    }

    /// The forged header list, case preserved, in forge order.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Look up a forged header value case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reply envelope
// ---------------------------------------------------------------------------

/// A reply body before base64 encoding.
///
/// Textual bodies are UTF-8 encoded before base64; byte bodies are encoded
/// as-is. `Content-Length` always reflects the decoded byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// A textual body (error messages, JSON built by the proxy).
    Text(String),
    /// Raw bytes from the backend response.
    Bytes(Vec<u8>),
}

impl ReplyBody {
    /// The decoded byte view of the body.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Bytes(b) => b,
        }
    }

    /// Decoded length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Base64 encoding of the body.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.as_bytes())
    }
}

/// HTTP-ish headers carried inside a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyHeaders {
    /// Content type of the decoded body.
    #[serde(rename = "Content-Type")]
    pub content_type: String,
    /// Byte length of the *decoded* body.
    #[serde(rename = "Content-Length")]
    pub content_length: u64,
}

/// The reply envelope published back to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Request id echoed from the inbound envelope.
    pub id: Option<String>,
    /// Reply headers.
    pub headers: ReplyHeaders,
    /// HTTP status code of the outcome.
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Base64-encoded body.
    pub body: String,
}

impl ReplyEnvelope {
    /// Build a reply envelope from a body and status.
    ///
    /// `content_type` falls back to [`DEFAULT_REPLY_CONTENT_TYPE`].
    pub fn build(
        id: Option<String>,
        body: &ReplyBody,
        status_code: u16,
        content_type: Option<&str>,
    ) -> Self {
        Self {
            id,
            headers: ReplyHeaders {
                content_type: content_type.unwrap_or(DEFAULT_REPLY_CONTENT_TYPE).to_string(),
                content_length: body.len() as u64,
            },
            status_code,
            body: body.to_base64(),
        }
    }

    /// Serialize the envelope to its JSON wire bytes.
    pub fn to_payload(&self) -> Result<Vec<u8>, ProxyError> {
        serde_json::to_vec(self).map_err(|e| {
            ProxyError::new(ErrorKind::Internal, "reply envelope is not serializable")
                .with_source(e)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
