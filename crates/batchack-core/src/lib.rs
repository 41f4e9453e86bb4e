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

//! Batching acknowledgment consumer
//!
//! Deliveries pushed by a broker transport are accumulated in a lock-guarded
//! buffer, flushed by size or elapsed time, processed and then acknowledged on
//! the single context that owns the broker connection.

use thiserror::Error;

pub mod buffer;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod context;
pub mod input;
pub mod processor;
pub mod transport;

pub use buffer::{BatchBuffer, BatchBufferConfig, BatchMetrics};
pub use input::{Ack, Delivery};

/// Error in the batching consumer
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process errors: {0}")]
    Process(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The owning connection or channel is gone.
    #[error("Connection lost")]
    Disconnection,

    #[error("Acknowledgment error: {0}")]
    Ack(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Bytes = Vec<u8>;
