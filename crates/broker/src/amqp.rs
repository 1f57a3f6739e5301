use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicRejectOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::broker::{Broker, Destination};
use crate::error::{BrokerError, Result};
use crate::message::{Delivery, DeliveryMode, FieldValue, Message};

/// Any lapin failure leaves the channel unusable.
fn transport(error: lapin::Error) -> BrokerError {
    BrokerError::Transport(error.to_string())
}

fn to_amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Int(v) => AMQPValue::LongLongInt(*v),
        FieldValue::Float(v) => AMQPValue::Double(*v),
        FieldValue::Bool(v) => AMQPValue::Boolean(*v),
        FieldValue::String(v) => AMQPValue::LongString(v.clone().into()),
    }
}

fn from_amqp_value(value: &AMQPValue) -> FieldValue {
    match value {
        AMQPValue::Boolean(v) => FieldValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => FieldValue::Int((*v).into()),
        AMQPValue::ShortShortUInt(v) => FieldValue::Int((*v).into()),
        AMQPValue::ShortInt(v) => FieldValue::Int((*v).into()),
        AMQPValue::ShortUInt(v) => FieldValue::Int((*v).into()),
        AMQPValue::LongInt(v) => FieldValue::Int((*v).into()),
        AMQPValue::LongUInt(v) => FieldValue::Int((*v).into()),
        AMQPValue::LongLongInt(v) => FieldValue::Int(*v),
        AMQPValue::Float(v) => FieldValue::Float((*v).into()),
        AMQPValue::Double(v) => FieldValue::Float(*v),
        AMQPValue::ShortString(v) => FieldValue::String(v.as_str().to_string()),
        AMQPValue::LongString(v) => {
            FieldValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        other => FieldValue::String(format!("{other:?}")),
    }
}

fn to_properties(message: &Message) -> BasicProperties {
    let mut table = FieldTable::default();
    for (name, value) in message.properties() {
        table.insert(name.clone().into(), to_amqp_value(value));
    }

    let delivery_mode = match message.delivery_mode() {
        DeliveryMode::Persistent => 2,
        DeliveryMode::Transient => 1,
    };
    let mut properties = BasicProperties::default()
        .with_headers(table)
        .with_delivery_mode(delivery_mode);

    let headers = message.headers();
    if let Some(id) = &headers.message_id {
        properties = properties.with_message_id(id.clone().into());
    }
    if let Some(timestamp) = headers.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(content_type) = &headers.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(priority) = headers.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(app_id) = &headers.app_id {
        properties = properties.with_app_id(app_id.clone().into());
    }
    properties
}

fn to_delivery(queue: &str, delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let mut message = Message::new(delivery.data.clone());

    if let Some(table) = properties.headers() {
        for (name, value) in table.inner() {
            message.set_property(name.as_str(), from_amqp_value(value));
        }
    }
    if let Some(id) = properties.message_id() {
        message.set_message_id(id.as_str());
    }
    if let Some(timestamp) = properties.timestamp() {
        message.set_timestamp(*timestamp);
    }
    if let Some(content_type) = properties.content_type() {
        message.set_content_type(content_type.as_str());
    }
    if let Some(priority) = properties.priority() {
        message.set_priority(*priority);
    }
    if let Some(app_id) = properties.app_id() {
        message.set_app_id(app_id.as_str());
    }
    if *properties.delivery_mode() == Some(2) {
        message.set_delivery_mode(DeliveryMode::Persistent);
    }
    message.set_routing_key(delivery.routing_key.as_str());

    Delivery::new(message, delivery.delivery_tag, queue).with_redelivered(delivery.redelivered)
}

/// [`Broker`] backed by a lapin channel.
///
/// Receiving uses `basic.get` polling so that every receive is bounded and
/// a worker regains control between deliveries.
pub struct LapinBroker {
    connection: Connection,
    channel: Channel,
    poll_interval: Duration,
}

impl LapinBroker {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(transport)?;
        let channel = connection.create_channel().await.map_err(transport)?;
        info!("Connected to AMQP broker");

        Ok(LapinBroker {
            connection,
            channel,
            poll_interval: Duration::from_millis(100),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn publish(&self, destination: &Destination, message: Message) -> Result<()> {
        let (exchange, routing_key) = match destination {
            Destination::Queue(queue) => ("", queue.as_str()),
            Destination::Exchange { name, routing_key } => (name.as_str(), routing_key.as_str()),
        };

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                message.body(),
                to_properties(&message),
            )
            .await
            .map_err(transport)?
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn receive(&self, queue: &str, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(delivery) = self.receive_no_wait(queue).await? {
                return Ok(Some(delivery));
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    async fn receive_no_wait(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(transport)?;
        Ok(message.map(|m| to_delivery(queue, m.delivery)))
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(*delivery.delivery_tag(), BasicAckOptions::default())
            .await
            .map_err(transport)
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(*delivery.delivery_tag(), BasicRejectOptions { requeue })
            .await
            .map_err(transport)
    }

    async fn declare_queue(&self, queue: &str) -> Result<u32> {
        // Topology is provisioned elsewhere, a passive declare only reads the depth
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport)?;
        Ok(declared.message_count())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn create_temporary_queue(&self) -> Result<String> {
        let declared = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport)?;
        Ok(declared.name().as_str().to_string())
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing AMQP channel and connection");
        self.channel.close(200, "Bye").await.map_err(transport)?;
        self.connection.close(200, "Bye").await.map_err(transport)
    }
}
