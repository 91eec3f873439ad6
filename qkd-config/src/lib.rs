//! Configuration management for QKD nodes
//!
//! A node is configured entirely from the environment: an optional `.env`
//! file is loaded first, then every `QKD_*` variable overrides the built-in
//! defaults (`QKD_MIN_KEYS=5` sets `min_keys`, and so on).
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


use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment};
use qkd_types::{CredentialPaths, QkdTypeError, Role, SaeIdentity};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for all node settings
pub const ENV_PREFIX: &str = "QKD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid identity: {0}")]
    Identity(#[from] QkdTypeError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Node configuration
///
/// Flat on purpose so every field maps to exactly one `QKD_*` variable.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// `master` / `slave` (also accepts `alice` / `bob`)
    pub role: String,
    pub sae_id: String,
    pub partner_sae_id: String,
    /// Base URL of the local KME, e.g. `https://kme-a.example:443`
    pub endpoint: String,

    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,

    // Key buffer
    pub min_keys: usize,
    pub max_keys: usize,
    pub key_ttl_secs: u64,
    pub key_size_bits: u32,
    pub auto_refill: bool,
    pub refill_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,

    // Health monitoring
    pub poll_interval_secs: u64,
    pub failure_alert_threshold: u32,
    pub diagnostic_failure_threshold: u32,
    pub diagnostic_timeout_secs: u64,
    pub optimal_key_count: u64,
    pub warning_key_count: u64,
    pub good_latency_ms: u64,
    pub warning_latency_ms: u64,

    pub log_level: String,
}

impl NodeConfig {
    /// Load configuration from `.env` and `QKD_*` environment variables
    pub fn from_env() -> ConfigResult<Self> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let settings = Self::defaults()?
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from explicit key/value pairs on top of the
    /// defaults. Keys use field names (`min_keys`, not `QKD_MIN_KEYS`).
    pub fn from_pairs<'a, I>(pairs: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut builder = Self::defaults()?;
        for (key, value) in pairs {
            builder = builder.set_override(key, value)?;
        }

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> ConfigResult<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            .set_default("cert_path", "certs/client.crt")?
            .set_default("key_path", "certs/client.key")?
            .set_default("ca_path", "certs/ca.crt")?
            .set_default("connect_timeout_secs", 10_i64)?
            .set_default("request_timeout_secs", 10_i64)?
            .set_default("min_keys", 10_i64)?
            .set_default("max_keys", 50_i64)?
            .set_default("key_ttl_secs", 86_400_i64)?
            .set_default("key_size_bits", 256_i64)?
            .set_default("auto_refill", true)?
            .set_default("refill_interval_secs", 5_i64)?
            .set_default("cleanup_interval_secs", 60_i64)?
            .set_default("backoff_initial_ms", 1_000_i64)?
            .set_default("backoff_max_ms", 60_000_i64)?
            .set_default("backoff_multiplier", 2.0_f64)?
            .set_default("poll_interval_secs", 30_i64)?
            .set_default("failure_alert_threshold", 3_i64)?
            .set_default("diagnostic_failure_threshold", 5_i64)?
            .set_default("diagnostic_timeout_secs", 5_i64)?
            .set_default("optimal_key_count", 100_i64)?
            .set_default("warning_key_count", 20_i64)?
            .set_default("good_latency_ms", 500_i64)?
            .set_default("warning_latency_ms", 2_000_i64)?
            .set_default("log_level", "info")?)
    }

    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        self.role()?;

        if !self.endpoint.starts_with("https://") {
            return invalid(format!("endpoint must use https: {}", self.endpoint));
        }
        if self.max_keys == 0 {
            return invalid("max_keys must be greater than 0");
        }
        if self.min_keys > self.max_keys {
            return invalid(format!(
                "min_keys ({}) must not exceed max_keys ({})",
                self.min_keys, self.max_keys
            ));
        }
        if self.key_ttl_secs == 0 {
            return invalid("key_ttl_secs must be greater than 0");
        }
        if self.key_size_bits == 0 || self.key_size_bits % 8 != 0 {
            return invalid(format!(
                "key_size_bits must be a positive multiple of 8, got {}",
                self.key_size_bits
            ));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return invalid("timeouts must be greater than 0");
        }
        if self.refill_interval_secs == 0
            || self.cleanup_interval_secs == 0
            || self.poll_interval_secs == 0
        {
            return invalid("intervals must be greater than 0");
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return invalid("backoff_initial_ms must be in 1..=backoff_max_ms");
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier <= 1.0 {
            return invalid("backoff_multiplier must be greater than 1.0");
        }
        if self.failure_alert_threshold == 0 || self.diagnostic_failure_threshold == 0 {
            return invalid("failure thresholds must be greater than 0");
        }
        if self.warning_key_count > self.optimal_key_count {
            return invalid("warning_key_count must not exceed optimal_key_count");
        }
        if self.good_latency_ms > self.warning_latency_ms {
            return invalid("good_latency_ms must not exceed warning_latency_ms");
        }

        Ok(())
    }

    pub fn role(&self) -> ConfigResult<Role> {
        Ok(self.role.parse::<Role>()?)
    }

    pub fn credentials(&self) -> CredentialPaths {
        CredentialPaths::new(&self.cert_path, &self.key_path, &self.ca_path)
    }

    /// Immutable identity of this node within its pairing
    pub fn identity(&self) -> ConfigResult<SaeIdentity> {
        Ok(SaeIdentity::new(
            &self.sae_id,
            self.role()?,
            &self.partner_sae_id,
            &self.endpoint,
            self.credentials(),
        )?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.key_ttl_secs)
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.refill_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn diagnostic_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostic_timeout_secs)
    }

    pub fn good_latency(&self) -> Duration {
        Duration::from_millis(self.good_latency_ms)
    }

    pub fn warning_latency(&self) -> Duration {
        Duration::from_millis(self.warning_latency_ms)
    }
}

fn invalid<T>(message: impl Into<String>) -> ConfigResult<T> {
    Err(ConfigError::Invalid(message.into()))
}
