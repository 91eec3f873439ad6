//! Exponential backoff for the refill loop
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


use crate::error::PoolError;
use qkd_client::{ProtocolError, TransportError};
use qkd_config::NodeConfig;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.backoff_initial(),
            config.backoff_max(),
            config.backoff_multiplier,
        )
    }

    /// Delay after `attempt` consecutive failures (0 means no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // initial_delay * (multiplier ^ (attempt - 1)), capped
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(delay_ms as u64)
    }
}

/// Whether a failed KME call is worth retrying unchanged
pub fn is_retryable(error: &PoolError) -> bool {
    match error {
        PoolError::Protocol(protocol) => match protocol {
            ProtocolError::AuthenticationFailed(_)
            | ProtocolError::InvalidParameter(_)
            | ProtocolError::RoleMismatch(_)
            | ProtocolError::NodeUnreachable(TransportError::Configuration(_)) => false,
            ProtocolError::ServiceUnavailable(_)
            | ProtocolError::NodeUnreachable(_)
            | ProtocolError::KeyIdNotFound { .. }
            | ProtocolError::MalformedResponse(_)
            | ProtocolError::UnexpectedStatus { .. } => true,
        },
        PoolError::RoleMismatch(_) | PoolError::Configuration(_) | PoolError::ShutDown => false,
        PoolError::BufferExhausted | PoolError::CapacityExceeded { .. } => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_max_delay() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);

        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_is_retryable() {
        let unavailable = PoolError::Protocol(ProtocolError::ServiceUnavailable("busy".into()));
        let timeout = PoolError::Protocol(ProtocolError::NodeUnreachable(TransportError::Timeout(
            "slow".into(),
        )));
        let auth = PoolError::Protocol(ProtocolError::AuthenticationFailed("denied".into()));
        let param = PoolError::Protocol(ProtocolError::InvalidParameter("size".into()));

        assert!(is_retryable(&unavailable));
        assert!(is_retryable(&timeout));
        assert!(!is_retryable(&auth));
        assert!(!is_retryable(&param));
        assert!(!is_retryable(&PoolError::ShutDown));
    }
}
