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

//! Batch acknowledgment buffer
//!
//! Deliveries are appended from the delivery context and claimed in batches by
//! a periodic checker. The buffer and the flush timestamp share one lock, which
//! only ever covers in-memory work: acknowledgment happens after the snapshot
//! has been taken and the lock released.

use crate::config::duration;
use crate::{Delivery, Error};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Flush thresholds of a batch buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBufferConfig {
    /// Number of buffered deliveries that marks a batch as ready
    pub batch_size: usize,
    /// Time since the last flush after which a non-empty buffer is flushed
    #[serde(with = "duration")]
    pub batch_timeout: Duration,
}

impl BatchBufferConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::Config(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.batch_timeout.is_zero() {
            return Err(Error::Config(
                "batch_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchBufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchMetrics {
    pub received: Arc<AtomicU64>,
    pub flushes: Arc<AtomicU64>,
    pub processed: Arc<AtomicU64>,
    pub acknowledged: Arc<AtomicU64>,
    pub process_failures: Arc<AtomicU64>,
    pub ack_failures: Arc<AtomicU64>,
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            flushes: Arc::new(AtomicU64::new(0)),
            processed: Arc::new(AtomicU64::new(0)),
            acknowledged: Arc::new(AtomicU64::new(0)),
            process_failures: Arc::new(AtomicU64::new(0)),
            ack_failures: Arc::new(AtomicU64::new(0)),
        }
    }
}

struct BufferState {
    deliveries: Vec<Delivery>,
    last_flush: Instant,
}

pub struct BatchBuffer {
    config: BatchBufferConfig,
    state: Mutex<BufferState>,
    metrics: BatchMetrics,
}

impl BatchBuffer {
    pub fn new(config: BatchBufferConfig) -> Result<Self, Error> {
        Self::with_metrics(config, BatchMetrics::default())
    }

    pub fn with_metrics(config: BatchBufferConfig, metrics: BatchMetrics) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(BufferState {
                deliveries: Vec::with_capacity(config.batch_size),
                last_flush: Instant::now(),
            }),
            config,
            metrics,
        })
    }

    // Nothing held under this lock can be left half-updated, so a poisoned
    // guard is still usable.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a delivery. Reaching `batch_size` restarts the batch window so
    /// the periodic checker sees the batch as ready.
    pub fn on_delivery(&self, delivery: Delivery) {
        let mut state = self.lock();
        state.deliveries.push(delivery);
        if state.deliveries.len() >= self.config.batch_size {
            state.last_flush = Instant::now();
        }
        drop(state);
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim the whole buffer if it is non-empty and either the size or the
    /// timeout threshold has been reached.
    ///
    /// Returns `None` without touching the batch window otherwise. The batch
    /// may hold more than `batch_size` deliveries.
    pub fn periodic_check(&self) -> Option<Vec<Delivery>> {
        let batch = {
            let mut state = self.lock();
            if state.deliveries.is_empty() {
                return None;
            }

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_flush);
            if state.deliveries.len() < self.config.batch_size
                && elapsed < self.config.batch_timeout
            {
                return None;
            }

            state.last_flush = now;
            std::mem::replace(
                &mut state.deliveries,
                Vec::with_capacity(self.config.batch_size),
            )
        };

        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        debug!("Flushing batch of {} deliveries", batch.len());
        Some(batch)
    }

    /// Abandon everything still buffered, returning how many deliveries were
    /// dropped. The broker redelivers them once the connection goes away.
    pub fn drain(&self) -> usize {
        let mut state = self.lock();
        let abandoned = state.deliveries.len();
        state.deliveries.clear();
        abandoned
    }

    pub fn len(&self) -> usize {
        self.lock().deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().deliveries.is_empty()
    }

    pub fn last_flush_time(&self) -> Instant {
        self.lock().last_flush
    }

    pub fn config(&self) -> &BatchBufferConfig {
        &self.config
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::NoopAck;
    use crate::Ack;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn buffer(batch_size: usize, batch_timeout: Duration) -> BatchBuffer {
        BatchBuffer::new(BatchBufferConfig {
            batch_size,
            batch_timeout,
        })
        .unwrap()
    }

    fn delivery(payload: &str) -> Delivery {
        Delivery::new(payload.as_bytes().to_vec(), Arc::new(NoopAck))
    }

    fn payloads(batch: &[Delivery]) -> Vec<String> {
        batch
            .iter()
            .map(|d| String::from_utf8_lossy(d.payload()).to_string())
            .collect()
    }

    #[test]
    fn test_invalid_config() {
        let result = BatchBuffer::new(BatchBufferConfig {
            batch_size: 0,
            batch_timeout: Duration::from_secs(5),
        });
        assert!(matches!(result, Err(Error::Config(_))));

        let result = BatchBuffer::new(BatchBufferConfig {
            batch_size: 10,
            batch_timeout: Duration::ZERO,
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flush() {
        let buffer = buffer(3, Duration::from_secs(60));
        buffer.on_delivery(delivery("a"));
        buffer.on_delivery(delivery("b"));
        assert!(buffer.periodic_check().is_none());

        buffer.on_delivery(delivery("c"));
        let batch = buffer.periodic_check().unwrap();
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty());
        assert!(buffer.periodic_check().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flush() {
        let buffer = buffer(20, Duration::from_secs(5));
        buffer.on_delivery(delivery("only"));

        let mut flushes = Vec::new();
        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(1)).await;
            if let Some(batch) = buffer.periodic_check() {
                flushes.push(batch);
            }
        }

        assert_eq!(flushes.len(), 1);
        assert_eq!(payloads(&flushes[0]), vec!["only"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_preserved() {
        let buffer = buffer(5, Duration::from_secs(5));
        let expected: Vec<String> = (1..=5).map(|i| format!("Message {}", i)).collect();
        for p in &expected {
            buffer.on_delivery(delivery(p));
        }

        let batch = buffer.periodic_check().unwrap();
        assert_eq!(payloads(&batch), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_is_noop() {
        let buffer = buffer(2, Duration::from_secs(1));
        let before = buffer.last_flush_time();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(buffer.periodic_check().is_none());
        assert_eq!(buffer.last_flush_time(), before);
        assert_eq!(buffer.metrics().flushes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_then_burst() {
        let buffer = buffer(20, Duration::from_secs(5));
        for i in 0..25 {
            buffer.on_delivery(delivery(&i.to_string()));
        }
        assert_eq!(buffer.len(), 25);

        let batch = buffer.periodic_check().unwrap();
        assert_eq!(batch.len(), 25);
        assert!(buffer.is_empty());
        assert_eq!(buffer.metrics().received.load(Ordering::Relaxed), 25);
        assert_eq!(buffer.metrics().flushes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaching_size_restarts_window() {
        let buffer = buffer(2, Duration::from_secs(5));
        let start = buffer.last_flush_time();

        tokio::time::advance(Duration::from_secs(3)).await;
        buffer.on_delivery(delivery("a"));
        assert_eq!(buffer.last_flush_time(), start);

        buffer.on_delivery(delivery("b"));
        assert_eq!(
            buffer.last_flush_time(),
            start + Duration::from_secs(3)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_restarts_window() {
        let buffer = buffer(10, Duration::from_secs(5));
        buffer.on_delivery(delivery("a"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(buffer.periodic_check().is_some());

        buffer.on_delivery(delivery("b"));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(buffer.periodic_check().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(buffer.periodic_check().map(|b| b.len()), Some(1));
    }

    #[test]
    fn test_drain_abandons_buffered() {
        let buffer = buffer(10, Duration::from_secs(5));
        buffer.on_delivery(delivery("a"));
        buffer.on_delivery(delivery("b"));
        assert_eq!(buffer.drain(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.periodic_check().is_none());
    }

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait]
    impl Ack for CountingAck {
        async fn ack(&self) -> Result<(), Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_deliveries_flushed_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let buffer = Arc::new(buffer(7, Duration::from_millis(1)));
        let counters: Vec<Arc<AtomicUsize>> = (0..PRODUCERS * PER_PRODUCER)
            .map(|_| Arc::new(AtomicUsize::new(0)))
            .collect();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buffer = buffer.clone();
                let counters = counters[p * PER_PRODUCER..(p + 1) * PER_PRODUCER].to_vec();
                thread::spawn(move || {
                    for counter in counters {
                        buffer.on_delivery(Delivery::new(vec![], Arc::new(CountingAck(counter))));
                    }
                })
            })
            .collect();

        let mut flushed = Vec::new();
        while producers.iter().any(|h| !h.is_finished()) {
            if let Some(batch) = buffer.periodic_check() {
                flushed.extend(batch);
            }
        }
        for handle in producers {
            handle.join().unwrap();
        }
        while !buffer.is_empty() {
            thread::sleep(Duration::from_millis(2));
            if let Some(batch) = buffer.periodic_check() {
                flushed.extend(batch);
            }
        }

        assert_eq!(flushed.len(), PRODUCERS * PER_PRODUCER);
        futures::executor::block_on(async {
            for delivery in &flushed {
                delivery.ack().await.unwrap();
            }
        });
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }
}
