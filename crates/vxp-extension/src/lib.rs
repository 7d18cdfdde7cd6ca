// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-extension descriptors for the vCD extension proxy.
//!
//! An [`ExtensionDescriptor`] is the immutable record binding one routing key
//! to one HTTP backend: the broker coordinates the proxy consumes from, and
//! everything needed to forge the outbound request (endpoint, auth, TLS
//! policy, timeout, URI rewrite).  Descriptors are built from the registry
//! before consumer startup and shared read-only afterwards.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;
use url::Url;
use vxp_config::{ConfigError, Registry};
use vxp_error::{ErrorKind, ProxyError};

/// Default queue message TTL in milliseconds.
pub const DEFAULT_MESSAGE_TTL_MS: u64 = 30_000;

/// Default backend timeout in seconds.
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while building descriptors from the registry.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// A registry read failed (missing required key, wrong type).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The configured exchange type is not an AMQP 0-9-1 exchange type.
    #[error("extension '{extension}': unknown exchange type '{value}'")]
    UnknownExchangeType {
        /// Extension being built.
        extension: String,
        /// Offending configured value.
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// AMQP exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    /// Topic exchange (the default for vCD extensions).
    Topic,
    /// Direct exchange.
    Direct,
    /// Fanout exchange.
    Fanout,
    /// Headers exchange.
    Headers,
}

impl ExchangeType {
    /// The AMQP wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
        }
    }

    fn parse(extension: &str, value: &str) -> Result<Self, DescriptorError> {
        match value {
            "topic" => Ok(Self::Topic),
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "headers" => Ok(Self::Headers),
            other => Err(DescriptorError::UnknownExchangeType {
                extension: extension.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Exchange the extension's queue is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Exchange type.
    pub kind: ExchangeType,
    /// Whether the exchange is durable.
    pub durable: bool,
}

/// Queue the proxy consumes the extension's requests from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Per-message TTL in milliseconds.
    pub message_ttl_ms: u64,
}

/// Basic-auth credentials for a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Substring rewrite applied to the assembled backend URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriRewrite {
    /// Substring to replace (semantic string match, not a regex).
    pub pattern: String,
    /// Replacement text.
    pub replacement: String,
}

/// HTTP backend an extension's requests are dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    /// URL prefix requests are appended to.
    pub endpoint: String,
    /// Optional basic-auth credentials.
    pub auth: Option<BasicCredentials>,
    /// Whether to verify the backend's TLS certificate.
    pub ssl_verify: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Optional URI rewrite rule.
    pub uri_rewrite: Option<UriRewrite>,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Immutable per-extension record. One per configured extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    /// Extension name, unique.
    pub name: String,
    /// Routing key, unique across all descriptors.
    pub routing_key: String,
    /// Whether the proxy declares the exchange/queue pair or assumes the
    /// broker already has them.
    pub declare: bool,
    /// Exchange spec.
    pub exchange: ExchangeSpec,
    /// Queue spec.
    pub queue: QueueSpec,
    /// Backend spec.
    pub backend: BackendSpec,
}

impl ExtensionDescriptor {
    /// Build one descriptor from `extensions.<name>.*`.
    pub fn from_registry(registry: &Registry, name: &str) -> Result<Self, DescriptorError> {
        let amqp = format!("extensions.{name}.amqp");
        let backend = format!("extensions.{name}.backend");

        let kind_raw = registry.str_or(&format!("{amqp}.exchange.type"), "topic")?;
        let exchange = ExchangeSpec {
            name: registry.require_str(&format!("{amqp}.exchange.name"))?,
            kind: ExchangeType::parse(name, &kind_raw)?,
            durable: registry.bool_or(&format!("{amqp}.exchange.durable"), true)?,
        };

        let queue = QueueSpec {
            name: registry.require_str(&format!("{amqp}.queue.name"))?,
            message_ttl_ms: registry
                .u64_or(&format!("{amqp}.queue.message_ttl"), DEFAULT_MESSAGE_TTL_MS)?,
        };

        let auth = if registry.contains(&format!("{backend}.auth")) {
            Some(BasicCredentials {
                username: registry.str_or(&format!("{backend}.auth.username"), "")?,
                password: registry.str_or(&format!("{backend}.auth.password"), "")?,
            })
        } else {
            None
        };

        let uri_rewrite = if registry.contains(&format!("{backend}.uri_replace")) {
            Some(UriRewrite {
                pattern: registry.str_or(&format!("{backend}.uri_replace.pattern"), "")?,
                replacement: registry.str_or(&format!("{backend}.uri_replace.by"), "")?,
            })
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            routing_key: registry.require_str(&format!("{amqp}.routing_key"))?,
            declare: registry.bool_or(&format!("{amqp}.declare"), true)?,
            exchange,
            queue,
            backend: BackendSpec {
                endpoint: registry.require_str(&format!("{backend}.endpoint"))?,
                auth,
                ssl_verify: registry.bool_or(&format!("{backend}.ssl_verify"), true)?,
                timeout: Duration::from_secs(
                    registry.u64_or(&format!("{backend}.timeout"), DEFAULT_BACKEND_TIMEOUT_SECS)?,
                ),
                uri_rewrite,
            },
        })
    }

    /// Assemble the full backend URL for a request.
    ///
    /// Concatenates `endpoint + uri`, appends `?query` when non-empty, then
    /// applies the configured rewrite (plain substring, all occurrences) to
    /// the whole URL. A result that does not parse as an absolute URL fails
    /// the request with [`ErrorKind::ConfigError`].
    pub fn backend_url(&self, uri: &str, query: Option<&str>) -> Result<String, ProxyError> {
        let mut full = format!("{}{uri}", self.backend.endpoint);
        if let Some(q) = query {
            if !q.is_empty() {
                full.push('?');
                full.push_str(q);
            }
        }
        if let Some(rw) = &self.backend.uri_rewrite {
            if !rw.pattern.is_empty() {
                full = full.replace(&rw.pattern, &rw.replacement);
            }
        }
        Url::parse(&full).map_err(|e| {
            ProxyError::new(
                ErrorKind::ConfigError,
                format!("assembled backend URL '{full}' is not absolute"),
            )
            .with_source(e)
        })?;
        Ok(full)
    }

    /// Basic-auth credentials, when configured.
    pub fn auth(&self) -> Option<&BasicCredentials> {
        self.backend.auth.as_ref()
    }

    /// The broker coordinates this extension consumes from.
    pub fn queue_spec(&self) -> (&ExchangeSpec, &QueueSpec) {
        (&self.exchange, &self.queue)
    }
}

/// Build all descriptors in the registry's enumeration order.
pub fn load_descriptors(registry: &Registry) -> Result<Vec<ExtensionDescriptor>, DescriptorError> {
    registry
        .extension_names()?
        .iter()
        .map(|name| ExtensionDescriptor::from_registry(registry, name))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
