//! Pairing health monitoring
//!
//! Polls KME status, classifies the link, tracks failure streaks and raises
//! alerts. Advisory only: nothing here sits on the key request path.
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


use crate::alert::AlertSink;
use crate::diagnostics::DiagnosticSuite;
use chrono::{DateTime, Utc};
use qkd_client::KmeClient;
use qkd_config::NodeConfig;
use qkd_types::{AlertEvent, AlertKind, HealthLevel, MonitoringRecord, StatusSnapshot};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Classification thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Stored keys needed for `Optimal`
    pub optimal_key_count: u64,
    /// Below this the pairing is at least `Warning`
    pub warning_key_count: u64,
    /// Latency at or above this is at best `Good`
    pub good_latency: Duration,
    /// Latency at or above this is at best `Warning`
    pub warning_latency: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            optimal_key_count: 100,
            warning_key_count: 20,
            good_latency: Duration::from_millis(500),
            warning_latency: Duration::from_secs(2),
        }
    }
}

impl HealthThresholds {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            optimal_key_count: config.optimal_key_count,
            warning_key_count: config.warning_key_count,
            good_latency: config.good_latency(),
            warning_latency: config.warning_latency(),
        }
    }

    /// `None` for `stored_key_count` means the poll failed
    pub fn classify(&self, stored_key_count: Option<u64>, latency: Duration) -> HealthLevel {
        match stored_key_count {
            None | Some(0) => HealthLevel::Critical,
            Some(stored) if stored < self.warning_key_count || latency >= self.warning_latency => {
                HealthLevel::Warning
            }
            Some(stored) if stored < self.optimal_key_count || latency >= self.good_latency => {
                HealthLevel::Good
            }
            Some(_) => HealthLevel::Optimal,
        }
    }
}

/// Outcome of one status poll
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub level: HealthLevel,
    pub latency: Duration,
    pub snapshot: Option<StatusSnapshot>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_reachable(&self) -> bool {
        self.error.is_none()
    }

    pub fn stored_key_count(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.stored_key_count)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub thresholds: HealthThresholds,
    /// Consecutive failures before a `ConsecutiveFailures` alert
    pub failure_alert_threshold: u32,
    /// Consecutive failures before diagnostics are started
    pub diagnostic_failure_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            failure_alert_threshold: 3,
            diagnostic_failure_threshold: 5,
        }
    }
}

impl MonitorConfig {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            thresholds: HealthThresholds::from_config(config),
            failure_alert_threshold: config.failure_alert_threshold,
            diagnostic_failure_threshold: config.diagnostic_failure_threshold,
        }
    }
}

#[derive(Default)]
struct MonitorState {
    record: MonitoringRecord,
    failure_alerted: bool,
    empty_alerted: bool,
}

pub struct HealthMonitor {
    client: Arc<dyn KmeClient>,
    config: MonitorConfig,
    sink: Arc<dyn AlertSink>,
    diagnostics: Option<Arc<DiagnosticSuite>>,
    state: Mutex<MonitorState>,
    latest: watch::Sender<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(client: Arc<dyn KmeClient>, config: MonitorConfig, sink: Arc<dyn AlertSink>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            client,
            config,
            sink,
            diagnostics: None,
            state: Mutex::new(MonitorState::default()),
            latest,
        }
    }

    /// Run this suite in the background once a failure streak reaches
    /// `diagnostic_failure_threshold`
    pub fn with_diagnostics(mut self, suite: Arc<DiagnosticSuite>) -> Self {
        self.diagnostics = Some(suite);
        self
    }

    pub fn record(&self) -> MonitoringRecord {
        self.state
            .lock()
            .map(|state| state.record.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<HealthReport>> {
        self.latest.subscribe()
    }

    /// Poll KME status once and classify it. Does not touch the record.
    pub async fn poll(&self) -> HealthReport {
        let started = Instant::now();
        let result = self.client.get_status().await;
        let latency = started.elapsed();

        match result {
            Ok(snapshot) => HealthReport {
                level: self
                    .config
                    .thresholds
                    .classify(Some(snapshot.stored_key_count), latency),
                latency,
                snapshot: Some(snapshot),
                error: None,
                checked_at: Utc::now(),
            },
            Err(e) => HealthReport {
                level: HealthLevel::Critical,
                latency,
                snapshot: None,
                error: Some(e.to_string()),
                checked_at: Utc::now(),
            },
        }
    }

    /// Poll, update the record and raise any alerts due
    pub async fn run_cycle(&self) -> HealthReport {
        let report = self.poll().await;
        let identity = self.client.identity();

        let mut alerts = Vec::new();
        let mut start_diagnostics = false;
        let (consecutive_failures, uptime) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };

            if report.is_reachable() {
                state.record.record_success(report.checked_at);
                if state.failure_alerted {
                    state.failure_alerted = false;
                    alerts.push(AlertKind::Recovered);
                }

                if report.stored_key_count() == Some(0) {
                    if !state.empty_alerted {
                        state.empty_alerted = true;
                        alerts.push(AlertKind::Critical);
                    }
                } else {
                    state.empty_alerted = false;
                }
            } else {
                state.record.record_failure(report.checked_at);
                let failures = state.record.consecutive_failures;
                if failures >= self.config.failure_alert_threshold && !state.failure_alerted {
                    state.failure_alerted = true;
                    alerts.push(AlertKind::ConsecutiveFailures);
                }
                start_diagnostics = failures == self.config.diagnostic_failure_threshold;
            }

            (state.record.consecutive_failures, state.record.uptime_ratio())
        };

        for kind in alerts {
            let message = match kind {
                AlertKind::ConsecutiveFailures => format!(
                    "KME status failed {} times in a row: {}",
                    consecutive_failures,
                    report.error.as_deref().unwrap_or("unknown error")
                ),
                AlertKind::Recovered => "KME status polling recovered".to_string(),
                AlertKind::Critical => "KME reports no stored key material".to_string(),
            };
            let alert = AlertEvent::new(
                identity.sae_id(),
                identity.partner_sae_id(),
                kind,
                message,
                consecutive_failures,
            );
            self.sink.notify(alert).await;
        }

        if start_diagnostics {
            if let Some(suite) = self.diagnostics.clone() {
                warn!(
                    consecutive_failures = consecutive_failures,
                    "Starting diagnostics after repeated failures"
                );
                tokio::spawn(async move {
                    suite.run().await.log_summary();
                });
            }
        }

        match &report.error {
            None => info!(
                partner = identity.partner_sae_id(),
                level = %report.level,
                stored_key_count = report.stored_key_count().unwrap_or(0),
                latency_ms = report.latency.as_millis() as u64,
                uptime = uptime,
                "Health check"
            ),
            Some(error) => warn!(
                partner = identity.partner_sae_id(),
                level = %report.level,
                consecutive_failures = consecutive_failures,
                uptime = uptime,
                error = %error,
                "Health check failed"
            ),
        }

        self.latest.send_replace(Some(report.clone()));
        report
    }

    /// Poll every `interval` until `shutdown` turns true
    pub async fn run_continuous(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            partner = self.client.identity().partner_sae_id(),
            interval_secs = interval.as_secs(),
            "Health monitoring started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health monitoring stopped");
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_continuous(interval, shutdown).await })
    }
}
