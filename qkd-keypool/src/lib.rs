//! Concurrent key supply for QKD pairings
//!
//! - [`manager::KeyBufferManager`]: exactly-once issuance of buffered keys,
//!   background refill (master) or import by ID (slave)
//! - [`health::HealthMonitor`]: status polling, failure streaks and alerts
//! - [`diagnostics::DiagnosticSuite`]: credential and connectivity checks
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


pub mod alert;
pub mod backoff;
pub mod buffer;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod manager;
pub mod refill;

pub use alert::{AlertSink, ChannelAlertSink, TracingAlertSink};
pub use backoff::{is_retryable, BackoffPolicy};
pub use buffer::{
    BufferHandle, BufferLimits, BufferState, BufferStats, InsertOutcome, KeySource, Reservation,
};
pub use diagnostics::{DiagnosticCheck, DiagnosticReport, DiagnosticSuite};
pub use error::{PoolError, PoolResult};
pub use health::{HealthMonitor, HealthReport, HealthThresholds, MonitorConfig};
pub use manager::{KeyBufferManager, PoolConfig};
pub use refill::{RefillStats, RefillWorker};
