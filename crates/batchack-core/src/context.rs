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

//! Owning context
//!
//! Broker clients commonly forbid using a connection or channel from more than
//! one execution context. Work that touches the broker is therefore queued to
//! the single task that owns the connection, which runs it strictly in
//! submission order.

use crate::Error;
use flume::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type ContextTask = BoxFuture<'static, ()>;

/// Thread-safe hand-off into an [`OwningContext`].
#[derive(Clone)]
pub struct ContextHandle {
    sender: Sender<ContextTask>,
}

impl ContextHandle {
    /// Queue `task` to run on the owning context. Returns immediately.
    pub fn run_on_owning_context<F>(&self, task: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(task.boxed())
            .map_err(|_| Error::Disconnection)
    }
}

pub struct OwningContext {
    sender: Sender<ContextTask>,
    receiver: Receiver<ContextTask>,
}

impl OwningContext {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver }
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            sender: self.sender.clone(),
        }
    }

    /// Run queued tasks one at a time until cancelled.
    ///
    /// Each task completes before the next one starts. Tasks still queued at
    /// cancellation are dropped, and later hand-offs fail.
    pub async fn run(self, cancellation_token: CancellationToken) {
        let Self { sender, receiver } = self;
        drop(sender);

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    break;
                }
                result = receiver.recv_async() => {
                    match result {
                        Ok(task) => task.await,
                        Err(_) => break,
                    }
                }
            }
        }

        let abandoned = receiver.drain().count();
        if abandoned > 0 {
            warn!("Owning context stopped with {} pending tasks", abandoned);
        }
        info!("Owning context stopped");
    }
}

impl Default for OwningContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let context = OwningContext::new();
        let handle = context.handle();
        let token = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10u64 {
            let seen = seen.clone();
            handle
                .run_on_owning_context(async move {
                    // Earlier tasks sleep longer; order must still hold.
                    tokio::time::sleep(Duration::from_millis(10 - i)).await;
                    seen.lock().unwrap().push(i);
                })
                .unwrap();
        }

        let stop = token.clone();
        let seen_done = seen.clone();
        handle
            .run_on_owning_context(async move {
                assert_eq!(seen_done.lock().unwrap().len(), 10);
                stop.cancel();
            })
            .unwrap();

        context.run(token).await;
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_hand_off_from_plain_thread() {
        let context = OwningContext::new();
        let handle = context.handle();
        let token = CancellationToken::new();
        let ran = Arc::new(Mutex::new(false));

        let ran_clone = ran.clone();
        let stop = token.clone();
        std::thread::spawn(move || {
            handle
                .run_on_owning_context(async move {
                    *ran_clone.lock().unwrap() = true;
                    stop.cancel();
                })
                .unwrap();
        })
        .join()
        .unwrap();

        context.run(token).await;
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_hand_off_fails_after_stop() {
        let context = OwningContext::new();
        let handle = context.handle();
        let token = CancellationToken::new();
        token.cancel();

        context.run(token).await;
        assert!(matches!(
            handle.run_on_owning_context(async {}),
            Err(Error::Disconnection)
        ));
    }

    #[tokio::test]
    async fn test_stops_when_all_handles_dropped() {
        let context = OwningContext::new();
        let handle = context.handle();
        handle.run_on_owning_context(async {}).unwrap();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), context.run(CancellationToken::new()))
            .await
            .unwrap();
    }
}
