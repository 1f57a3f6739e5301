use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rabbit_worker_broker::Broker;

use crate::config::{RabbitConfig, BROKER_DRIVER};
use crate::errors::{RabbitWorkerError, Result};
use crate::failed::FailedJobStore;
use crate::queue::Queue;

fn invalid(message: impl Into<String>) -> RabbitWorkerError {
    RabbitWorkerError::InvalidConfiguration(message.into())
}

/// Builds queues and the failed job store out of a [`RabbitConfig`].
#[derive(Clone)]
pub struct Connector {
    config: RabbitConfig,
    brokers: HashMap<String, Arc<dyn Broker>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.config)
            .field("brokers", &self.brokers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Connector {
    /// A connector without any broker attached, see [`Connector::with_broker`].
    pub fn new(config: RabbitConfig) -> Self {
        Connector {
            config,
            brokers: HashMap::new(),
        }
    }

    /// Uses `broker` for every queue connection referencing `connection`.
    pub fn with_broker(mut self, connection: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        self.brokers.insert(connection.into(), broker);
        self
    }

    /// Opens one AMQP connection per configured connection URI.
    #[cfg(feature = "lapin")]
    pub async fn open(config: RabbitConfig) -> Result<Self> {
        let mut connector = Connector::new(config);
        for (name, uri) in &connector.config.connections {
            let broker = rabbit_worker_broker::LapinBroker::connect(uri).await?;
            tracing::info!(connection = name.as_str(), "Connected to broker");
            connector.brokers.insert(name.clone(), Arc::new(broker));
        }
        Ok(connector)
    }

    pub fn config(&self) -> &RabbitConfig {
        &self.config
    }

    /// Whether the queue connection is one this crate consumes itself.
    pub fn is_broker_backed(&self, name: &str) -> bool {
        self.config
            .queue_connections
            .get(name)
            .is_some_and(|c| c.driver == BROKER_DRIVER)
    }

    fn broker(&self, connection: &str) -> Result<Arc<dyn Broker>> {
        if !self.config.connections.contains_key(connection) && !self.brokers.contains_key(connection) {
            return Err(invalid(format!("Unknown connection '{connection}'")));
        }
        self.brokers
            .get(connection)
            .cloned()
            .ok_or_else(|| invalid(format!("Connection '{connection}' is not open")))
    }

    fn queue_name(&self, queue_id: &str) -> Result<&str> {
        self.config
            .queues
            .get(queue_id)
            .map(|q| q.name.as_str())
            .ok_or_else(|| invalid(format!("Unknown queue ID '{queue_id}'")))
    }

    /// Builds the producer of the queue connection `name`.
    pub fn connect(&self, name: &str) -> Result<Queue> {
        let config = self
            .config
            .queue_connections
            .get(name)
            .ok_or_else(|| invalid(format!("Unknown queue connection '{name}'")))?;

        if config.driver != BROKER_DRIVER {
            return Err(invalid(format!(
                "Queue connection '{name}' uses the '{}' driver",
                config.driver
            )));
        }
        let connection = config
            .connection
            .as_deref()
            .ok_or_else(|| invalid(format!("RabbitMQ connection name was not passed for '{name}'")))?;
        let queue_id = config
            .queue_id
            .as_deref()
            .ok_or_else(|| invalid(format!("RabbitMQ queue ID was not passed for '{name}'")))?;

        let mut queue = Queue::new(self.broker(connection)?, name, self.queue_name(queue_id)?)
            .with_time_to_run(Duration::from_millis(config.timeout))
            .with_resume(config.resume);

        if let Some(exchange_id) = &config.delayed_exchange_id {
            let exchange = self
                .config
                .exchanges
                .get(exchange_id)
                .ok_or_else(|| invalid(format!("Unknown exchange ID '{exchange_id}'")))?;
            queue = queue.with_delayed_exchange(&exchange.name);
        }

        Ok(queue)
    }

    /// Consumer tag prefix configured for the queue behind `name`, if any.
    pub fn consumer_tag(&self, name: &str) -> Option<&str> {
        let queue_id = self.config.queue_connections.get(name)?.queue_id.as_deref()?;
        self.config.queues.get(queue_id)?.consumer_tag.as_deref()
    }

    pub fn failed_store(&self) -> Result<FailedJobStore> {
        let config = self
            .config
            .failed
            .as_ref()
            .ok_or_else(|| invalid("No failed job store configured"))?;
        let connection = config
            .connection
            .as_deref()
            .ok_or_else(|| invalid("RabbitMQ connection name was not passed for the failed job store"))?;
        let queue_id = config
            .queue_id
            .as_deref()
            .ok_or_else(|| invalid("RabbitMQ queue ID was not passed for the failed job store"))?;

        Ok(FailedJobStore::new(
            self.broker(connection)?,
            self.queue_name(queue_id)?,
        ))
    }
}
