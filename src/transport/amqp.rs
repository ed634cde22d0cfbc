//! AMQP implementation of the [`Transport`] contract using `lapin`
//!
//! Envelope metadata rides in the native AMQP message properties:
//! `correlation_id` and `reply_to` map onto their protocol counterparts,
//! the hierarchical path, the fault marker and all user headers go into the
//! headers table. The body is passed through untouched.
//!
//! Deliveries are consumed with `no_ack` so the broker considers a message
//! handled the moment it is pushed down the wire, matching the
//! fire-and-forget semantics of the layer above.

use super::{DeliveryStream, QueueOptions, Transport};
use crate::constants::{FAULT_HEADER, PATH_HEADER};
use crate::envelope::{CorrelationId, Envelope, Headers};
use crate::error::{ConnectionError, ConsumeError, PublishError};
use crate::topic::Topic;
use crate::EmptyResult;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use log::{debug, warn};

const CLOSE_REPLY_CODE: u16 = 200;

/// [`Transport`] backed by one AMQP connection and channel
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    /// Connects to the broker behind the given AMQP URI
    ///
    /// Fails with [`ConnectionError::Broker`] when the broker is unreachable
    /// or refuses authentication.
    pub async fn connect(uri: &str) -> Result<Self, ConnectionError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| ConnectionError::Broker(Box::new(e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConnectionError::Broker(Box::new(e)))?;

        debug!("Connected to AMQP broker at {}", uri);

        Ok(Self {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_topic_exchange(&self, name: &str) -> Result<(), ConnectionError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectionError::Setup(Box::new(e)))
    }

    async fn declare_direct_exchange(&self, name: &str) -> Result<(), ConnectionError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectionError::Setup(Box::new(e)))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<(), ConnectionError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::Setup(Box::new(e)))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConnectionError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectionError::Setup(Box::new(e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                encode_properties(envelope),
            )
            .await
            .map_err(map_publish_error)?
            .await
            .map_err(map_publish_error)?;

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, ConsumeError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumeError::Subscribe {
                queue: queue.to_owned(),
                source: Box::new(e),
            })?;

        let stream = consumer.map(|delivery| match delivery {
            Ok(delivery) => decode(delivery.properties, delivery.data),
            Err(e) => Err(ConsumeError::Stream(Box::new(e))),
        });

        Ok(stream.boxed())
    }

    async fn shutdown(&self) -> EmptyResult {
        self.channel.close(CLOSE_REPLY_CODE, "shutting down").await?;
        self.connection
            .close(CLOSE_REPLY_CODE, "shutting down")
            .await?;

        debug!("Released AMQP channel and connection");
        Ok(())
    }
}

fn map_publish_error(e: lapin::Error) -> PublishError {
    match e {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            PublishError::ChannelClosed
        }
        other => PublishError::Delivery(Box::new(other)),
    }
}

fn encode_properties(envelope: &Envelope) -> BasicProperties {
    let mut headers = FieldTable::default();

    headers.insert(
        PATH_HEADER.into(),
        AMQPValue::LongString(envelope.path.to_string().into()),
    );

    if envelope.fault {
        headers.insert(FAULT_HEADER.into(), AMQPValue::Boolean(true));
    }

    for (key, value) in &envelope.headers {
        if key == PATH_HEADER || key == FAULT_HEADER {
            warn!("Dropping user header {} colliding with a reserved header", key);
            continue;
        }

        headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
    }

    let mut properties = BasicProperties::default().with_headers(headers);

    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }

    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }

    properties
}

fn decode(properties: BasicProperties, body: Vec<u8>) -> Result<Envelope, ConsumeError> {
    let mut path = None;
    let mut fault = false;
    let mut user_headers = Headers::new();

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            match (key.as_str(), value) {
                (PATH_HEADER, AMQPValue::LongString(value)) => {
                    path = Some(Topic::new(&String::from_utf8_lossy(value.as_bytes())));
                }
                (FAULT_HEADER, AMQPValue::Boolean(value)) => fault = *value,
                (key, AMQPValue::LongString(value)) => {
                    user_headers.insert(
                        key.to_owned(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    );
                }
                // Other value types are not part of the wire contract
                _ => {}
            }
        }
    }

    let path = path.ok_or_else(|| {
        ConsumeError::MalformedDelivery("delivery is missing the path header".into())
    })?;

    Ok(Envelope {
        path,
        headers: user_headers,
        body,
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| CorrelationId::from(id.as_str())),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|reply_to| reply_to.as_str().to_owned()),
        fault,
    })
}
