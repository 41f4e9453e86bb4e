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

//! Batch consumer session
//!
//! A session wires a transport's delivery stream into a [`BatchBuffer`] and
//! runs three contexts: the delivery pump, the periodic flush checker, and the
//! owning context, which is the task that called [`BatchConsumer::run`].

use crate::buffer::{BatchBuffer, BatchMetrics};
use crate::config::ConsumerConfig;
use crate::context::{ContextHandle, OwningContext};
use crate::processor::{process_batch, BatchProcessor};
use crate::transport::{DeliveryStream, QueueOptions, Transport};
use crate::Error;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub struct BatchConsumer {
    transport: Arc<dyn Transport>,
    queue: QueueOptions,
    buffer: Arc<BatchBuffer>,
    processor: Arc<dyn BatchProcessor>,
    check_interval: Duration,
}

impl BatchConsumer {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &ConsumerConfig,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            transport,
            queue: config.queue_options(),
            buffer: Arc::new(BatchBuffer::new(config.batch.clone())?),
            processor,
            check_interval: config.check_interval,
        })
    }

    pub fn metrics(&self) -> &BatchMetrics {
        self.buffer.metrics()
    }

    pub fn buffer(&self) -> &Arc<BatchBuffer> {
        &self.buffer
    }

    /// Consume until cancelled or until the delivery stream ends or fails.
    ///
    /// Blocks the calling task, which acts as the owning context: every
    /// acknowledgment is issued from here. Deliveries still buffered or awaiting
    /// acknowledgment when the session stops are abandoned to broker
    /// redelivery. A failed delivery stream is returned as the session error.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<(), Error> {
        self.transport.connect().await?;
        self.transport.declare_queue(&self.queue).await?;
        let deliveries = self.transport.consume(&self.queue.name).await?;
        info!("Started consuming from queue: {}", self.queue.name);

        let session_token = cancellation_token.child_token();
        let context = OwningContext::new();
        let tracker = TaskTracker::new();

        let delivery_task = tracker.spawn(Self::do_deliveries(
            session_token.clone(),
            deliveries,
            self.buffer.clone(),
        ));

        tracker.spawn(Self::do_flush(
            session_token.clone(),
            self.buffer.clone(),
            self.check_interval,
            context.handle(),
            self.processor.clone(),
        ));

        tracker.close();

        context.run(session_token.clone()).await;
        session_token.cancel();
        tracker.wait().await;

        let abandoned = self.buffer.drain();
        if abandoned > 0 {
            warn!(
                "Abandoned {} buffered deliveries for redelivery",
                abandoned
            );
        }

        let result = match delivery_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Unknown(format!("Delivery task failed: {}", e))),
        };

        if let Err(e) = self.transport.close().await {
            error!("Failed to close transport: {}", e);
        }
        info!("Stopped consuming from queue: {}", self.queue.name);

        result
    }

    async fn do_deliveries(
        cancellation_token: CancellationToken,
        mut deliveries: DeliveryStream,
        buffer: Arc<BatchBuffer>,
    ) -> Result<(), Error> {
        let result = loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    break Ok(());
                }
                next = deliveries.next() => {
                    match next {
                        Some(Ok(delivery)) => buffer.on_delivery(delivery),
                        Some(Err(e)) => {
                            error!("Delivery stream failed: {}", e);
                            break Err(e);
                        }
                        None => {
                            info!("Delivery stream ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        // The rest of the session cannot make progress without deliveries.
        cancellation_token.cancel();
        info!("Delivery pump stopped");
        result
    }

    async fn do_flush(
        cancellation_token: CancellationToken,
        buffer: Arc<BatchBuffer>,
        check_interval: Duration,
        handle: ContextHandle,
        processor: Arc<dyn BatchProcessor>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    let Some(batch) = buffer.periodic_check() else {
                        continue;
                    };
                    let task = process_batch(processor.clone(), batch, buffer.metrics().clone());
                    if let Err(e) = handle.run_on_owning_context(task) {
                        error!("Failed to hand batch to owning context: {}", e);
                        break;
                    }
                }
            }
        }
        info!("Flush checker stopped");
    }
}
