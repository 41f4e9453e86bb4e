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

//! Batch processing
//!
//! A flushed batch is processed and acknowledged delivery by delivery, in
//! arrival order, on the owning context.

use crate::buffer::BatchMetrics;
use crate::{Delivery, Error};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// User-defined work done on each delivery before it is acknowledged.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Result<(), Error>;
}

/// Logs every payload as text.
pub struct LogProcessor;

#[async_trait]
impl BatchProcessor for LogProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<(), Error> {
        info!("{}", String::from_utf8_lossy(delivery.payload()));
        Ok(())
    }
}

/// Process and acknowledge a batch.
///
/// Deliveries are independent of each other: one that fails processing is left
/// unacknowledged for the broker to redeliver, and a failed acknowledgment is
/// not retried. Neither stops the rest of the batch.
pub async fn process_batch(
    processor: Arc<dyn BatchProcessor>,
    deliveries: Vec<Delivery>,
    metrics: BatchMetrics,
) {
    let batch_size = deliveries.len();
    info!("Processing batch of {} messages", batch_size);

    let mut acked = 0;
    for delivery in deliveries {
        if let Err(e) = processor.process(&delivery).await {
            warn!("Failed to process delivery, leaving it unacknowledged: {}", e);
            metrics.process_failures.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        metrics.processed.fetch_add(1, Ordering::Relaxed);

        match delivery.ack().await {
            Ok(_) => {
                acked += 1;
                metrics.acknowledged.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!("Failed to ack message: {}", e);
                metrics.ack_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    if acked < batch_size {
        warn!("Acknowledged {} of {} messages", acked, batch_size);
    } else {
        debug!("Acknowledged {} messages", acked);
    }
}
