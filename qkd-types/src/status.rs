//! KME status snapshots and pairing health records
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


use crate::error::{QkdTypeError, Result};
use crate::schemas::StatusResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated view of a KME status response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub source_kme_id: String,
    pub target_kme_id: String,
    pub master_sae_id: String,
    pub slave_sae_id: String,
    pub key_size: u64,
    pub stored_key_count: u64,
    pub max_key_count: u64,
    pub max_key_per_request: u64,
    pub max_key_size: u64,
    pub min_key_size: u64,
    pub max_sae_id_count: u64,
    pub observed_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Validate a wire response and stamp it with the observation time
    pub fn from_response(response: StatusResponse, observed_at: DateTime<Utc>) -> Result<Self> {
        for (field, value) in [
            ("source_KME_ID", &response.source_kme_id),
            ("target_KME_ID", &response.target_kme_id),
            ("master_SAE_ID", &response.master_sae_id),
            ("slave_SAE_ID", &response.slave_sae_id),
        ] {
            if value.trim().is_empty() {
                return Err(QkdTypeError::MissingField(field.to_string()));
            }
        }

        if response.min_key_size > response.max_key_size {
            return Err(QkdTypeError::Validation(format!(
                "min_key_size {} exceeds max_key_size {}",
                response.min_key_size, response.max_key_size
            )));
        }
        if response.stored_key_count > response.max_key_count {
            return Err(QkdTypeError::Validation(format!(
                "stored_key_count {} exceeds max_key_count {}",
                response.stored_key_count, response.max_key_count
            )));
        }

        Ok(Self {
            source_kme_id: response.source_kme_id,
            target_kme_id: response.target_kme_id,
            master_sae_id: response.master_sae_id,
            slave_sae_id: response.slave_sae_id,
            key_size: response.key_size,
            stored_key_count: response.stored_key_count,
            max_key_count: response.max_key_count,
            max_key_per_request: response.max_key_per_request,
            max_key_size: response.max_key_size,
            min_key_size: response.min_key_size,
            max_sae_id_count: response.max_sae_id_count,
            observed_at,
        })
    }

    /// Fill level of the KME key store (0.0 - 1.0)
    pub fn fill_ratio(&self) -> f64 {
        if self.max_key_count == 0 {
            return 0.0;
        }
        self.stored_key_count as f64 / self.max_key_count as f64
    }
}

/// Health classification of a pairing, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Optimal,
    Good,
    Warning,
    Critical,
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthLevel::Optimal => "optimal",
            HealthLevel::Good => "good",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        };
        write!(f, "{}", label)
    }
}

/// Rolling liveness statistics for one pairing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringRecord {
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_checks: u64,
    pub successful_checks: u64,
}

impl MonitoringRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.total_checks += 1;
        self.successful_checks += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.total_checks += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(at);
    }

    pub fn failed_checks(&self) -> u64 {
        self.total_checks - self.successful_checks
    }

    /// Share of successful checks (1.0 before the first check)
    pub fn uptime_ratio(&self) -> f64 {
        if self.total_checks == 0 {
            return 1.0;
        }
        self.successful_checks as f64 / self.total_checks as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> StatusResponse {
        StatusResponse {
            source_kme_id: "KME-A".to_string(),
            target_kme_id: "KME-B".to_string(),
            master_sae_id: "Alice2".to_string(),
            slave_sae_id: "Bob2".to_string(),
            key_size: 256,
            stored_key_count: 50,
            max_key_count: 100,
            max_key_per_request: 10,
            max_key_size: 1024,
            min_key_size: 64,
            max_sae_id_count: 0,
            status_extension: None,
        }
    }

    #[test]
    fn test_snapshot_from_valid_response() {
        let snapshot = StatusSnapshot::from_response(response(), Utc::now()).unwrap();
        assert_eq!(snapshot.stored_key_count, 50);
        assert!((snapshot.fill_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_rejects_empty_ids() {
        let mut bad = response();
        bad.master_sae_id = " ".to_string();
        assert_eq!(
            StatusSnapshot::from_response(bad, Utc::now()),
            Err(QkdTypeError::MissingField("master_SAE_ID".to_string()))
        );
    }

    #[test]
    fn test_snapshot_rejects_inverted_key_sizes() {
        let mut bad = response();
        bad.min_key_size = 2048;
        assert!(matches!(
            StatusSnapshot::from_response(bad, Utc::now()),
            Err(QkdTypeError::Validation(_))
        ));
    }

    #[test]
    fn test_health_levels_order_by_severity() {
        assert!(HealthLevel::Optimal < HealthLevel::Good);
        assert!(HealthLevel::Warning < HealthLevel::Critical);
        assert_eq!(HealthLevel::Warning.to_string(), "warning");
    }

    #[test]
    fn test_monitoring_record_uptime() {
        let mut record = MonitoringRecord::new();
        assert_eq!(record.uptime_ratio(), 1.0);

        let now = Utc::now();
        record.record_success(now);
        record.record_failure(now);
        record.record_failure(now);
        assert_eq!(record.consecutive_failures, 2);
        assert_eq!(record.failed_checks(), 2);

        record.record_success(now);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.total_checks, 4);
        assert!((record.uptime_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
