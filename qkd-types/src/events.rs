//! Alert events emitted by pairing health monitoring
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Status polling failed `consecutive_failures` times in a row
    ConsecutiveFailures,
    /// A successful poll ended an alerted failure streak
    Recovered,
    /// The KME reports no stored key material
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sae_id: String,
    pub partner_sae_id: String,
    pub kind: AlertKind,
    pub message: String,
    pub consecutive_failures: u32,
}

impl AlertEvent {
    pub fn new(
        sae_id: impl Into<String>,
        partner_sae_id: impl Into<String>,
        kind: AlertKind,
        message: impl Into<String>,
        consecutive_failures: u32,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sae_id: sae_id.into(),
            partner_sae_id: partner_sae_id.into(),
            kind,
            message: message.into(),
            consecutive_failures,
        }
    }
}
