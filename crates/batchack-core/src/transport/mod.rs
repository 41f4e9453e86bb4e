/*
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! Transport component module
//!
//! A transport is the broker client: it declares queues, publishes payloads and
//! yields deliveries carrying their acknowledgment tokens.

use crate::{Delivery, Error};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

lazy_static::lazy_static! {
    static ref TRANSPORT_BUILDERS: RwLock<HashMap<String, Arc<dyn TransportBuilder>>> = RwLock::new(HashMap::new());
}

/// Deliveries in broker order. An `Err` item means the connection is unusable.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, Error>>;

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    /// Enables a priority queue accepting priorities `0..=max_priority`
    pub max_priority: Option<u8>,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_priority: None,
        }
    }
}

/// Per-message publish parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub priority: u8,
    /// Ask the broker to persist the message
    pub persistent: bool,
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the broker
    async fn connect(&self) -> Result<(), Error>;

    /// Declare a queue, creating it if needed
    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), Error>;

    /// Publish a payload routed to `queue`
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), Error>;

    /// Start a manually acknowledged consumer on `queue`
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, Error>;

    /// Close the broker connection
    async fn close(&self) -> Result<(), Error>;
}

pub trait TransportBuilder: Send + Sync {
    fn build(&self, config: &Option<serde_json::Value>) -> Result<Arc<dyn Transport>, Error>;
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub transport_type: String,
    #[serde(flatten)]
    pub config: Option<serde_json::Value>,
}

impl TransportConfig {
    /// Building transport components
    pub fn build(&self) -> Result<Arc<dyn Transport>, Error> {
        let builders = TRANSPORT_BUILDERS
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(builder) = builders.get(&self.transport_type) {
            builder.build(&self.config)
        } else {
            Err(Error::Config(format!(
                "Unknown transport type: {}",
                self.transport_type
            )))
        }
    }
}

pub fn register_transport_builder(
    type_name: &str,
    builder: Arc<dyn TransportBuilder>,
) -> Result<(), Error> {
    let mut builders = TRANSPORT_BUILDERS
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    if builders.contains_key(type_name) {
        return Err(Error::Config(format!(
            "Transport type already registered: {}",
            type_name
        )));
    }
    builders.insert(type_name.to_string(), builder);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn connect(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn declare_queue(&self, _options: &QueueOptions) -> Result<(), Error> {
            Ok(())
        }

        async fn publish(
            &self,
            _queue: &str,
            _payload: &[u8],
            _options: &PublishOptions,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn consume(&self, _queue: &str) -> Result<DeliveryStream, Error> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn close(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    struct NullTransportBuilder;

    impl TransportBuilder for NullTransportBuilder {
        fn build(&self, _config: &Option<serde_json::Value>) -> Result<Arc<dyn Transport>, Error> {
            Ok(Arc::new(NullTransport))
        }
    }

    #[test]
    fn test_registry() {
        register_transport_builder("test-null", Arc::new(NullTransportBuilder)).unwrap();
        assert!(matches!(
            register_transport_builder("test-null", Arc::new(NullTransportBuilder)),
            Err(Error::Config(_))
        ));

        let config = TransportConfig {
            transport_type: "test-null".to_string(),
            config: None,
        };
        assert!(config.build().is_ok());

        let unknown = TransportConfig {
            transport_type: "test-missing".to_string(),
            config: None,
        };
        assert!(matches!(unknown.build(), Err(Error::Config(_))));
    }

    #[test]
    fn test_queue_options_defaults() {
        let options = QueueOptions::new("batch_queue");
        assert!(options.durable);
        assert_eq!(options.max_priority, None);
    }
}
