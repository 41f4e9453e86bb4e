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

//! Memory transport
//!
//! In-process FIFO queues. Priorities are accepted but not used for ordering.
//! Every acknowledged delivery tag is recorded so callers can check
//! exactly-once acknowledgment.

use batchack_core::transport::{
    register_transport_builder, DeliveryStream, PublishOptions, QueueOptions, Transport,
    TransportBuilder,
};
use batchack_core::{Ack, Bytes, Delivery, Error};

use async_trait::async_trait;
use flume::{Receiver, Sender};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

struct MemoryMessage {
    tag: u64,
    payload: Bytes,
}

struct MemoryQueue {
    sender: Sender<MemoryMessage>,
    receiver: Receiver<MemoryMessage>,
}

#[derive(Default)]
struct AckLog {
    acked: Vec<u64>,
}

pub struct MemoryTransport {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    next_tag: AtomicU64,
    ack_log: Arc<Mutex<AckLog>>,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            ack_log: Arc::new(Mutex::new(AckLog::default())),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Delivery tags in the order they were acknowledged.
    pub fn acked_tags(&self) -> Vec<u64> {
        self.ack_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acked
            .clone()
    }

    /// Messages published to `queue` and not yet handed to a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .map_or(0, |q| q.receiver.len())
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Disconnection)
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<(), Error> {
        self.ensure_connected()?;
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.entry(options.name.clone()).or_insert_with(|| {
            let (sender, receiver) = flume::unbounded();
            MemoryQueue { sender, receiver }
        });
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        _options: &PublishOptions,
    ) -> Result<(), Error> {
        self.ensure_connected()?;
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(memory_queue) = queues.get(queue) else {
            return Err(Error::Process(format!("Queue is not declared: {}", queue)));
        };

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        memory_queue
            .sender
            .send(MemoryMessage {
                tag,
                payload: payload.to_vec(),
            })
            .map_err(|_| Error::Disconnection)?;
        debug!("Published delivery {} to {}", tag, queue);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, Error> {
        self.ensure_connected()?;
        let receiver = {
            let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(memory_queue) = queues.get(queue) else {
                return Err(Error::Process(format!("Queue is not declared: {}", queue)));
            };
            memory_queue.receiver.clone()
        };

        let ack_log = self.ack_log.clone();
        let connected = self.connected.clone();
        let deliveries = receiver.into_stream().map(move |message| {
            let ack = MemoryAck {
                tag: message.tag,
                ack_log: ack_log.clone(),
                connected: connected.clone(),
            };
            Ok(Delivery::new(message.payload, Arc::new(ack)))
        });

        Ok(deliveries.boxed())
    }

    /// Disconnects and drops every queue, ending open delivery streams once
    /// they have yielded what was already queued.
    async fn close(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

struct MemoryAck {
    tag: u64,
    ack_log: Arc<Mutex<AckLog>>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Ack for MemoryAck {
    async fn ack(&self) -> Result<(), Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Disconnection);
        }

        let mut log = self.ack_log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.acked.contains(&self.tag) {
            return Err(Error::Ack(format!("Unknown delivery tag: {}", self.tag)));
        }
        log.acked.push(self.tag);
        Ok(())
    }
}

pub(crate) struct MemoryTransportBuilder;

impl TransportBuilder for MemoryTransportBuilder {
    fn build(&self, _config: &Option<serde_json::Value>) -> Result<Arc<dyn Transport>, Error> {
        Ok(Arc::new(MemoryTransport::new()))
    }
}

pub fn init() -> Result<(), Error> {
    register_transport_builder("memory", Arc::new(MemoryTransportBuilder))
}
