//! Health monitor tests
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


mod common;

use common::MockKme;
use qkd_client::{ProtocolError, TransportError};
use qkd_keypool::{ChannelAlertSink, HealthMonitor, MonitorConfig};
use qkd_types::{AlertKind, HealthLevel};
use std::sync::Arc;
use std::time::Duration;

fn unreachable() -> ProtocolError {
    ProtocolError::NodeUnreachable(TransportError::ConnectionRefused(
        "connection refused".to_string(),
    ))
}

#[tokio::test]
async fn test_low_stock_is_warning() {
    let kme = MockKme::master();
    kme.push_status(Ok(3));
    let (sink, _alerts) = ChannelAlertSink::new();
    let monitor = HealthMonitor::new(kme, MonitorConfig::default(), Arc::new(sink));

    let report = monitor.run_cycle().await;
    assert_eq!(report.level, HealthLevel::Warning);
    assert_eq!(report.stored_key_count(), Some(3));
    assert_eq!(monitor.latest().map(|r| r.level), Some(HealthLevel::Warning));
}

#[tokio::test]
async fn test_failure_streak_alerts_once_then_recovers() {
    let kme = MockKme::master();
    for _ in 0..4 {
        kme.push_status(Err(unreachable()));
    }
    kme.push_status(Ok(500));

    let (sink, mut alerts) = ChannelAlertSink::new();
    let monitor = HealthMonitor::new(kme, MonitorConfig::default(), Arc::new(sink));

    for _ in 0..2 {
        assert_eq!(monitor.run_cycle().await.level, HealthLevel::Critical);
    }
    assert!(alerts.try_recv().is_err());

    monitor.run_cycle().await;
    let alert = alerts.try_recv().unwrap();
    assert_eq!(alert.kind, AlertKind::ConsecutiveFailures);
    assert_eq!(alert.consecutive_failures, 3);
    assert_eq!(alert.partner_sae_id, "Bob2");

    // Still failing: no second alert for the same streak
    monitor.run_cycle().await;
    assert!(alerts.try_recv().is_err());

    let report = monitor.run_cycle().await;
    assert_eq!(report.level, HealthLevel::Optimal);
    assert_eq!(alerts.try_recv().unwrap().kind, AlertKind::Recovered);

    let record = monitor.record();
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.total_checks, 5);
    assert_eq!(record.successful_checks, 1);
    assert!((record.uptime_ratio() - 0.2).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_empty_store_raises_one_critical_alert() {
    let kme = MockKme::slave();
    kme.push_status(Ok(0));
    kme.push_status(Ok(0));
    kme.push_status(Ok(50));

    let (sink, mut alerts) = ChannelAlertSink::new();
    let monitor = HealthMonitor::new(kme, MonitorConfig::default(), Arc::new(sink));

    assert_eq!(monitor.run_cycle().await.level, HealthLevel::Critical);
    assert_eq!(monitor.run_cycle().await.level, HealthLevel::Critical);
    assert_eq!(monitor.run_cycle().await.level, HealthLevel::Good);

    assert_eq!(alerts.try_recv().unwrap().kind, AlertKind::Critical);
    assert!(alerts.try_recv().is_err());
    assert_eq!(monitor.record().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_monitoring_stops_on_shutdown() {
    let kme = MockKme::master();
    let (sink, _alerts) = ChannelAlertSink::new();
    let monitor = Arc::new(HealthMonitor::new(kme, MonitorConfig::default(), Arc::new(sink)));

    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = monitor.clone().spawn(Duration::from_secs(30), shutdown_rx);

    tokio::time::sleep(Duration::from_secs(65)).await;
    shutdown.send(true).unwrap();
    task.await.unwrap();

    // Polls at 0s, 30s and 60s
    assert_eq!(monitor.record().total_checks, 3);
}
