use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    Channel, Connection, ConnectionProperties, Consumer,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};

use crate::{
    Envelope,
    queue::{
        Acknowledge, QueueError,
        robust::{Connect, Link, Robust},
    },
};

/// RabbitMQ queue with automatic reconnection.
pub type RabbitMq = Robust<RabbitMqConnector>;

impl RabbitMq {
    /// Connect to the broker and start consuming `settings.queue`.
    ///
    /// Fails with a connection error if the broker is unreachable or the
    /// queue does not exist.
    pub async fn open(settings: RabbitMqSettings) -> Result<Self, QueueError> {
        let interval = settings.reconnect_interval;
        Robust::connect(RabbitMqConnector { settings }, interval).await
    }
}

/// Connection settings for a RabbitMQ consumer.
#[derive(Debug, Clone)]
pub struct RabbitMqSettings {
    uri: String,
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    reconnect_interval: Duration,
}

impl RabbitMqSettings {
    pub fn new(uri: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            queue: queue.into(),
            consumer_tag: "feeder".to_owned(),
            prefetch: 1,
            reconnect_interval: Duration::from_secs(5),
        }
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Number of unacknowledged deliveries the broker may push ahead.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Fixed delay between reconnection attempts.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

/// Opens AMQP links for [`Robust`].
///
/// ## Design
///
/// - Each link owns its own connection and channel
/// - The queue is declared passively: it must already exist
/// - Consumption uses manual acknowledgment (`no_ack = false`)
pub struct RabbitMqConnector {
    settings: RabbitMqSettings,
}

#[async_trait]
impl Connect for RabbitMqConnector {
    type Handle = RabbitMqHandle;
    type Link = RabbitMqLink;

    #[tracing::instrument(skip(self), fields(queue = %self.settings.queue))]
    async fn connect(&self) -> Result<RabbitMqLink, QueueError> {
        let settings = &self.settings;
        let connection = Connection::connect(&settings.uri, ConnectionProperties::default())
            .await
            .map_err(QueueError::connection)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(QueueError::connection)?;

        channel
            .basic_qos(settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(QueueError::connection)?;
        channel
            .queue_declare(
                &settings.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::connection)?;

        let consumer = channel
            .basic_consume(
                &settings.queue,
                &settings.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::connection)?;

        tracing::debug!("Consumer started");
        Ok(RabbitMqLink {
            connection,
            _channel: channel,
            consumer,
        })
    }
}

/// Live AMQP consumer.
pub struct RabbitMqLink {
    connection: Connection,
    _channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Link for RabbitMqLink {
    type Handle = RabbitMqHandle;

    async fn next(&mut self) -> Option<Result<Envelope<RabbitMqHandle>, QueueError>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(err) => return Some(Err(QueueError::connection(err))),
        };
        Some(Ok(RabbitMqHandle::envelope(delivery)))
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.connection
            .close(200, "consumer shutdown")
            .await
            .map_err(QueueError::closed)
    }
}

/// Acknowledgment handle of an AMQP delivery.
#[derive(Debug)]
pub struct RabbitMqHandle {
    delivery: Delivery,
}

impl RabbitMqHandle {
    fn envelope(mut delivery: Delivery) -> Envelope<Self> {
        let body = std::mem::take(&mut delivery.data);
        tracing::trace!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Delivery received",
        );
        Envelope::new(Self { delivery }, body)
    }
}

#[async_trait]
impl Acknowledge for RabbitMqHandle {
    async fn ack(&self) -> Result<(), QueueError> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(QueueError::acknowledgment)?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(QueueError::acknowledgment)?;
        Ok(())
    }
}
