// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message consumer and dispatcher.
//!
//! Registration walks the configured extensions in document order, declares
//! each exchange/queue pair (unless the broker is pre-provisioned), starts
//! one consumer per extension, and freezes the routing table.  Every
//! delivery is acknowledged up front (availability over exactly-once; a
//! redelivery would replay the backend's side effects), then parsed and
//! handed to a fresh request worker.  Worker failures never reach the
//! consumer loop.

use crate::backend::ExtensionRuntime;
use crate::inflight::InflightTracker;
use crate::precheck::PreCheck;
use crate::publisher::{ReplyProperties, ReplyPublisher};
use crate::routing::RoutingTable;
use crate::worker;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicRejectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, ExchangeKind};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use vxp_error::ProxyError;
use vxp_extension::ExchangeType;
use vxp_protocol::InboundEnvelope;

/// Errors raised while registering consumers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A broker operation failed.
    #[error("broker operation failed: {0}")]
    Broker(#[from] lapin::Error),

    /// A proxy-level failure (duplicate routing key).
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

/// Reply coordinates lifted from a delivery's properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyAddress {
    /// `correlation_id` message property.
    pub correlation_id: Option<String>,
    /// `reply_to` message property.
    pub reply_to: Option<String>,
    /// `replyToExchange` application header.
    pub reply_to_exchange: Option<String>,
}

/// Lift the reply coordinates out of AMQP message properties.
pub fn reply_address(properties: &BasicProperties) -> ReplyAddress {
    let header_string = |name: &str| {
        properties.headers().as_ref().and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == name)
                .and_then(|(_, value)| match value {
                    AMQPValue::LongString(s) => {
                        Some(String::from_utf8_lossy(s.as_bytes()).into_owned())
                    }
                    _ => None,
                })
        })
    };
    ReplyAddress {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        reply_to_exchange: header_string("replyToExchange"),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Shared {
    table: RoutingTable,
    publisher: ReplyPublisher,
    precheck: Arc<dyn PreCheck>,
    worker_slots: Arc<Semaphore>,
    inflight: InflightTracker,
}

/// Owns the consumer set and routes deliveries to request workers.
pub struct Dispatcher {
    shared: Arc<Shared>,
    consumers: Vec<(String, lapin::Consumer)>,
}

impl Dispatcher {
    /// Declare broker resources and register one consumer per extension.
    ///
    /// Fails before any consumer exists when two descriptors share a routing
    /// key; the caller must treat that as fatal.
    pub async fn register(
        channel: &Channel,
        runtimes: Vec<ExtensionRuntime>,
        precheck: Arc<dyn PreCheck>,
        max_workers: usize,
    ) -> Result<Self, DispatchError> {
        let table = RoutingTable::build(runtimes)?;

        let mut consumers = Vec::with_capacity(table.len());
        for runtime in table.in_order() {
            let descriptor = runtime.descriptor();
            info!(extension = %descriptor.name, "initializing a new listener");

            if descriptor.declare {
                debug!(extension = %descriptor.name, exchange = %descriptor.exchange.name,
                    "declaring exchange");
                channel
                    .exchange_declare(
                        &descriptor.exchange.name,
                        exchange_kind(descriptor.exchange.kind),
                        ExchangeDeclareOptions {
                            durable: descriptor.exchange.durable,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;

                debug!(extension = %descriptor.name, queue = %descriptor.queue.name,
                    "declaring queue");
                let mut arguments = FieldTable::default();
                arguments.insert(
                    ShortString::from("x-message-ttl".to_string()),
                    AMQPValue::LongInt(
                        i32::try_from(descriptor.queue.message_ttl_ms).unwrap_or(i32::MAX),
                    ),
                );
                channel
                    .queue_declare(
                        &descriptor.queue.name,
                        QueueDeclareOptions::default(),
                        arguments,
                    )
                    .await?;
                channel
                    .queue_bind(
                        &descriptor.queue.name,
                        &descriptor.exchange.name,
                        &descriptor.routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }

            let consumer = channel
                .basic_consume(
                    &descriptor.queue.name,
                    &format!("vxp-{}", descriptor.name),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            consumers.push((descriptor.name.clone(), consumer));
            info!(extension = %descriptor.name, routing_key = %descriptor.routing_key,
                "extension registered");
        }
        info!(extensions = consumers.len(),
            "all extensions registered, listening for incoming messages");

        Ok(Self {
            shared: Arc::new(Shared {
                table,
                publisher: ReplyPublisher::new(channel.clone()),
                precheck,
                worker_slots: Arc::new(Semaphore::new(max_workers)),
                inflight: InflightTracker::new(),
            }),
            consumers,
        })
    }

    /// Handle counting in-flight workers, for the supervisor's drain.
    pub fn inflight(&self) -> InflightTracker {
        self.shared.inflight.clone()
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Drive all consumer loops until `shutdown` flips or every stream ends.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut loops = Vec::with_capacity(self.consumers.len());
        for (extension, consumer) in self.consumers {
            let shared = Arc::clone(&self.shared);
            let mut shutdown = shutdown.clone();
            loops.push(tokio::spawn(async move {
                let mut consumer = consumer;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            info!(extension = %extension, "listener stopping");
                            break;
                        }
                        next = consumer.next() => match next {
                            Some(Ok(delivery)) => process_task(&shared, delivery).await,
                            Some(Err(error)) => {
                                error!(extension = %extension, error = %error,
                                    "error on consumer stream");
                            }
                            None => {
                                warn!(extension = %extension, "consumer stream ended");
                                break;
                            }
                        }
                    }
                }
            }));
        }
        for handle in loops {
            let _ = handle.await;
        }
    }
}

/// Process a single delivery.
///
/// The ack comes first, before any processing: availability over
/// exactly-once, since a redelivery would replay the backend's side effects.
/// An unknown routing key (a misconfigured producer) is then handed back to
/// the broker with a best-effort requeue and the delivery is dropped here.
async fn process_task(shared: &Arc<Shared>, delivery: Delivery) {
    if let Err(error) = delivery.acker.ack(BasicAckOptions::default()).await {
        error!(error = %error, "message may not have been acknowledged");
    }

    let routing_key = delivery.routing_key.as_str().to_string();
    let Some(runtime) = shared.table.get(&routing_key) else {
        error!(routing_key = %routing_key,
            "cannot find the configuration data for the routing key");
        if let Err(error) = delivery
            .acker
            .reject(BasicRejectOptions { requeue: true })
            .await
        {
            error!(error = %error, "message may not have been requeued");
        }
        return;
    };

    let extension = runtime.descriptor().name.clone();
    debug!(extension = %extension, routing_key = %routing_key, "new message received");

    let envelope = match InboundEnvelope::parse(&delivery.data) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(extension = %extension, error = %error,
                "invalid JSON data received, dropping the message");
            return;
        }
    };
    let address = reply_address(&delivery.properties);

    let runtime = Arc::clone(runtime);
    let shared = Arc::clone(shared);
    let guard = shared.inflight.start();
    tokio::spawn(async move {
        let _guard = guard;
        // Bounds backend pressure; acquisition happens off the consumer loop.
        let _permit = Arc::clone(&shared.worker_slots).acquire_owned().await.ok();
        let outcome = worker::execute(&runtime, &envelope, shared.precheck.as_ref()).await;
        let properties = ReplyProperties {
            extension,
            id: outcome.id,
            accept: outcome.accept,
            correlation_id: address.correlation_id,
            reply_to: address.reply_to,
            reply_to_exchange: address.reply_to_exchange,
            status_code: outcome.status,
            content_type: None,
        };
        shared.publisher.publish(&outcome.body, &properties).await;
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
