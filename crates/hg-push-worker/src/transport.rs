use crate::config::QueueBinding;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info, warn};

/// Settles a delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message for good
    async fn ack(&self) -> Result<()>;

    /// Hand the message back to its queue for redelivery
    async fn requeue(&self) -> Result<()>;

    /// Drop the message without redelivery
    async fn reject(&self) -> Result<()>;
}

/// A message received from one of the subscribed queues
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Vec<u8>,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        InboundMessage {
            delivery_tag,
            redelivered,
            body,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn requeue(&self) -> Result<()> {
        self.acker.requeue().await
    }

    pub async fn reject(&self) -> Result<()> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        self.0.reject(BasicRejectOptions { requeue: true }).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.0.reject(BasicRejectOptions { requeue: false }).await?;
        Ok(())
    }
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        InboundMessage::new(
            delivery.delivery_tag,
            delivery.redelivered,
            delivery.data,
            AmqpAcker(delivery.acker),
        )
    }
}

/// One broker connection and channel, held for the life of the worker
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        info!("Connected to broker, channel {}", channel.id());

        Ok(AmqpTransport {
            connection,
            channel,
        })
    }

    /// Declare the bindings and start consuming every queue.
    ///
    /// Deliveries from all queues arrive on one stream, in broker order per queue.
    pub async fn subscribe(
        &self,
        queues: &[QueueBinding],
        prefetch: Option<u16>,
        consumer_tag: &str,
    ) -> Result<DeliveryStream> {
        if queues.is_empty() {
            return Err(WorkerError::Config("no queues to subscribe to".to_string()));
        }

        if let Some(prefetch) = prefetch {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }

        let mut consumers = Vec::with_capacity(queues.len());
        for (index, binding) in queues.iter().enumerate() {
            self.declare(binding).await?;

            let tag = format!("{}-{}", consumer_tag, index);
            let consumer = self
                .channel
                .basic_consume(
                    &binding.name,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            info!("Consuming queue {} as {}", binding.name, tag);

            consumers.push(
                consumer
                    .map(|delivery| delivery.map(InboundMessage::from).map_err(WorkerError::from))
                    .boxed(),
            );
        }

        Ok(stream::select_all(consumers).boxed())
    }

    async fn declare(&self, binding: &QueueBinding) -> Result<()> {
        self.channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_declare(
                &binding.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                &binding.name,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(
            "Bound queue {} to exchange {} with key {}",
            binding.name, binding.exchange, binding.routing_key
        );
        Ok(())
    }

    /// Close channel and connection; unsettled deliveries go back to the broker
    pub async fn close(self) {
        if let Err(e) = self.channel.close(200, "worker shutting down").await {
            warn!("Failed to close channel: {}", e);
        }
        if let Err(e) = self.connection.close(200, "worker shutting down").await {
            warn!("Failed to close connection: {}", e);
        }
    }
}
