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

//! Inbound deliveries and their acknowledgment tokens.

use crate::{Bytes, Error};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Acknowledgment token handed out by a transport together with a payload.
///
/// Implementations talk to the broker, so `ack` must only be awaited on the
/// context that owns the broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ack: Send + Sync {
    async fn ack(&self) -> Result<(), Error>;
}

pub struct NoopAck;

#[async_trait]
impl Ack for NoopAck {
    async fn ack(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// One inbound message plus its acknowledgment token.
pub struct Delivery {
    payload: Bytes,
    redelivered: bool,
    ack: Arc<dyn Ack>,
}

impl Delivery {
    pub fn new(payload: Bytes, ack: Arc<dyn Ack>) -> Self {
        Self {
            payload,
            redelivered: false,
            ack,
        }
    }

    /// Mark the delivery as a broker redelivery.
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge this delivery through its token.
    pub async fn ack(&self) -> Result<(), Error> {
        self.ack.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
