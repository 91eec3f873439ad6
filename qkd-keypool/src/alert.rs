//! Alert delivery
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


use async_trait::async_trait;
use qkd_types::{AlertEvent, AlertKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Receiver of pairing alerts (pager, message bus, ...)
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: AlertEvent);
}

/// Writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, alert: AlertEvent) {
        match alert.kind {
            AlertKind::Recovered => info!(
                alert_id = %alert.alert_id,
                partner = %alert.partner_sae_id,
                message = %alert.message,
                "Pairing recovered"
            ),
            AlertKind::ConsecutiveFailures => error!(
                alert_id = %alert.alert_id,
                partner = %alert.partner_sae_id,
                consecutive_failures = alert.consecutive_failures,
                message = %alert.message,
                "Pairing alert"
            ),
            AlertKind::Critical => warn!(
                alert_id = %alert.alert_id,
                partner = %alert.partner_sae_id,
                message = %alert.message,
                "Pairing critical"
            ),
        }
    }
}

/// Forwards alerts to an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    sender: mpsc::UnboundedSender<AlertEvent>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn notify(&self, alert: AlertEvent) {
        if self.sender.send(alert).is_err() {
            warn!("Alert receiver dropped, alert discarded");
        }
    }
}
