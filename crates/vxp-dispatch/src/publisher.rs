// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reply publisher: addresses a worker outcome back to the requester.
//!
//! Replies go out on the direct exchange named by the delivery's
//! `replyToExchange` header, with the delivery's `reply_to` as routing key
//! and its `correlation_id` echoed.  vCD owns the reply exchange, so it is
//! never declared here.  Publish failures are logged and swallowed: the
//! delivery was already acknowledged, and letting the error surface would
//! re-fire the backend on redelivery.

use lapin::options::BasicPublishOptions;
use lapin::types::ShortString;
use lapin::{BasicProperties, Channel};
use tracing::{error, info, warn};
use vxp_error::{ErrorKind, ProxyError};
use vxp_protocol::{ReplyBody, ReplyEnvelope};

/// Expiration stamped on every reply message, in milliseconds. A requester
/// that has not collected its reply within this window has long timed out.
pub const REPLY_EXPIRATION_MS: u64 = 10_000;

/// Everything needed to address and build one reply.
#[derive(Debug, Clone, Default)]
pub struct ReplyProperties {
    /// Extension name, for log context.
    pub extension: String,
    /// Request id echoed into the reply envelope.
    pub id: String,
    /// The request's `Accept` header (informational).
    pub accept: Option<String>,
    /// Correlation id echoed from the delivery.
    pub correlation_id: Option<String>,
    /// Reply routing key from the delivery's `reply_to` property.
    pub reply_to: Option<String>,
    /// Reply exchange from the delivery's `replyToExchange` header.
    pub reply_to_exchange: Option<String>,
    /// HTTP status of the outcome.
    pub status_code: u16,
    /// Optional override for the reply envelope's `Content-Type`.
    pub content_type: Option<String>,
}

/// A reply rendered down to broker terms, ready to publish.
#[derive(Debug, Clone)]
pub struct PreparedReply {
    /// Target exchange (`replyToExchange`).
    pub exchange: String,
    /// Routing key (`reply_to`).
    pub routing_key: String,
    /// JSON reply-envelope bytes.
    pub payload: Vec<u8>,
    /// AMQP message properties (correlation id, expiration).
    pub properties: BasicProperties,
}

/// Render a reply down to broker terms.
///
/// Fails when the delivery carried no usable reply address; such replies
/// cannot be delivered anywhere and are dropped by the caller.
pub fn prepare(body: &ReplyBody, props: &ReplyProperties) -> Result<PreparedReply, ProxyError> {
    let routing_key = props
        .reply_to
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::new(ErrorKind::Internal, "delivery carried no reply_to"))?;
    let exchange = props
        .reply_to_exchange
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ProxyError::new(ErrorKind::Internal, "delivery carried no replyToExchange")
        })?;

    let envelope = ReplyEnvelope::build(
        Some(props.id.clone()),
        body,
        props.status_code,
        props.content_type.as_deref(),
    );

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from("application/json".to_string()))
        .with_expiration(ShortString::from(REPLY_EXPIRATION_MS.to_string()));
    if let Some(correlation_id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }

    Ok(PreparedReply {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        payload: envelope.to_payload()?,
        properties,
    })
}

/// Publishes reply envelopes over the shared broker channel.
///
/// `lapin` channels are safe for concurrent publishes, so every worker calls
/// this directly; no extra serialization is needed.
#[derive(Debug, Clone)]
pub struct ReplyPublisher {
    channel: Channel,
}

impl ReplyPublisher {
    /// Wrap a live channel.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Publish one reply. Never fails: addressing or broker problems are
    /// logged and the reply is abandoned (the requester times out upstream).
    pub async fn publish(&self, body: &ReplyBody, props: &ReplyProperties) {
        let prepared = match prepare(body, props) {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(extension = %props.extension, error = %err,
                    "cannot address reply, dropping it");
                return;
            }
        };

        // One retry on transient broker errors, then give up.
        for attempt in 0..2u8 {
            match self
                .channel
                .basic_publish(
                    &prepared.exchange,
                    &prepared.routing_key,
                    BasicPublishOptions::default(),
                    &prepared.payload,
                    prepared.properties.clone(),
                )
                .await
            {
                Ok(_confirm) => {
                    info!(extension = %props.extension, status = props.status_code,
                        reply_to = %prepared.routing_key, "reply published");
                    return;
                }
                Err(err) if attempt == 0 => {
                    warn!(extension = %props.extension, error = %err,
                        "reply publish failed, retrying once");
                }
                Err(err) => {
                    error!(extension = %props.extension, error = %err,
                        "reply publish failed, message may not have been sent");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
