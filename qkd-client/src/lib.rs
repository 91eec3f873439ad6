//! ETSI GS QKD 014 client
//!
//! Two layers:
//! - [`transport`]: one authenticated HTTPS request per call (mTLS to the KME)
//! - [`client`]: the `status`, `enc_keys` and `dec_keys` operations with typed
//!   errors and response validation
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


pub mod client;
pub mod error;
pub mod transport;

pub use client::{EtsiClient, KeyRequest, KmeClient, API_PREFIX};
pub use error::{ProtocolError, ProtocolResult, TransportError, TransportResult};
pub use transport::{HttpsTransport, Method, RawResponse, Transport, TransportConfig};
