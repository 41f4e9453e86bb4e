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

pub mod amqp09;
pub mod memory;

pub use memory::MemoryTransport;

use batchack_core::Error;
use std::sync::OnceLock;

static INITIALIZED: OnceLock<Result<(), String>> = OnceLock::new();

/// Register the transport builders. Safe to call more than once.
pub fn init() -> Result<(), Error> {
    INITIALIZED
        .get_or_init(|| {
            amqp09::init().map_err(|e| e.to_string())?;
            memory::init().map_err(|e| e.to_string())?;
            Ok(())
        })
        .clone()
        .map_err(Error::Config)
}
