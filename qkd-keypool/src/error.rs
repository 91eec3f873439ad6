//! Error types for the key buffer
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use qkd_client::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Key buffer exhausted: no key material available")]
    BufferExhausted,

    #[error("Capacity exceeded: {requested} keys requested, room for {available}")]
    CapacityExceeded { requested: usize, available: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Operation not permitted for this role: {0}")]
    RoleMismatch(String),

    #[error("Key buffer has shut down")]
    ShutDown,

    #[error("Invalid buffer configuration: {0}")]
    Configuration(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
