// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the vCD extension proxy.
//!
//! Every proxy error carries an [`ErrorKind`] (a machine-readable, stable
//! string tag), a human-readable message, and an optional cause.  Kinds that
//! reach the requester map to the HTTP status code published in the reply
//! envelope via [`ErrorKind::reply_status`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Request method is not in the supported set.
    MethodUnsupported,
    /// Backend did not answer within the configured timeout.
    BackendTimeout,
    /// Backend sent the request into a redirect loop.
    BackendTooManyRedirects,
    /// Connection to the backend was refused, reset, or failed DNS.
    BackendUnreachable,
    /// Any other HTTP-client failure talking to the backend.
    BackendProtocol,
    /// Unexpected failure inside a request worker.
    Internal,
    /// Delivery payload is not a valid envelope.
    ParseError,
    /// Delivery routing key is absent from the routing table.
    UnknownKey,
    /// Two extensions declare the same routing key.
    ConfigDuplicateKey,
    /// A configured value produced an unusable request (e.g. a rewritten
    /// backend URL that is not absolute).
    ConfigError,
}

impl ErrorKind {
    /// Stable `&'static str` representation of the kind (e.g.
    /// `"BACKEND_TIMEOUT"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MethodUnsupported => "METHOD_UNSUPPORTED",
            Self::BackendTimeout => "BACKEND_TIMEOUT",
            Self::BackendTooManyRedirects => "BACKEND_TOO_MANY_REDIRECTS",
            Self::BackendUnreachable => "BACKEND_UNREACHABLE",
            Self::BackendProtocol => "BACKEND_PROTOCOL",
            Self::Internal => "INTERNAL",
            Self::ParseError => "PARSE_ERROR",
            Self::UnknownKey => "UNKNOWN_KEY",
            Self::ConfigDuplicateKey => "CONFIG_DUPLICATE_KEY",
            Self::ConfigError => "CONFIG_ERROR",
        }
    }

    /// HTTP status published in the reply envelope for this kind, or `None`
    /// for kinds that never produce a reply (parse failures, unknown routing
    /// keys, startup configuration errors).
    pub fn reply_status(&self) -> Option<u16> {
        match self {
            Self::MethodUnsupported => Some(405),
            Self::BackendTimeout => Some(504),
            Self::BackendTooManyRedirects => Some(508),
            Self::BackendUnreachable => Some(503),
            Self::BackendProtocol => Some(502),
            Self::Internal | Self::ConfigError => Some(500),
            Self::ParseError | Self::UnknownKey | Self::ConfigDuplicateKey => None,
        }
    }

    /// Whether this kind is fatal at startup (the process must exit non-zero
    /// before consuming any message).
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Self::ConfigDuplicateKey)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProxyError
// ---------------------------------------------------------------------------

/// Unified proxy error.
///
/// Carries a stable [`ErrorKind`], a human-readable message, and an optional
/// source error for cause-chaining.
///
/// # Builder usage
///
/// ```
/// use vxp_error::{ErrorKind, ProxyError};
///
/// let err = ProxyError::new(ErrorKind::BackendTimeout, "no answer after 600 s");
/// assert_eq!(err.kind, ErrorKind::BackendTimeout);
/// ```
pub struct ProxyError {
    /// Machine-readable error kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProxyError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.kind.reply_status()`.
    pub fn reply_status(&self) -> Option<u16> {
        self.kind.reply_status()
    }
}

impl fmt::Debug for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ProxyError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
