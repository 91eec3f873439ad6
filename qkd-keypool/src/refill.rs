//! Background refill for master pairings
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


use crate::backoff::{is_retryable, BackoffPolicy};
use crate::buffer::{BufferHandle, KeySource};
use crate::error::{PoolError, PoolResult};
use qkd_client::{KeyRequest, KmeClient, ProtocolError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Counters for the refill task
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefillStats {
    pub cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub consecutive_failures: u32,
    pub keys_requested: u64,
    pub keys_received: u64,
    pub current_backoff: Duration,
    pub last_error: Option<String>,
}

/// Tops the buffer up to `min_keys` through `enc_keys`
pub struct RefillWorker {
    client: Arc<dyn KmeClient>,
    buffer: BufferHandle,
    key_size_bits: u32,
    backoff: BackoffPolicy,
    interval: Duration,
    // Held for the whole cycle, I/O included
    in_flight: Mutex<()>,
    stats: watch::Sender<RefillStats>,
}

impl RefillWorker {
    pub fn new(
        client: Arc<dyn KmeClient>,
        buffer: BufferHandle,
        key_size_bits: u32,
        backoff: BackoffPolicy,
        interval: Duration,
    ) -> Self {
        let (stats, _) = watch::channel(RefillStats::default());
        Self {
            client,
            buffer,
            key_size_bits,
            backoff,
            interval,
            in_flight: Mutex::new(()),
            stats,
        }
    }

    pub fn stats(&self) -> RefillStats {
        self.stats.borrow().clone()
    }

    /// Run one refill cycle; returns the number of keys added.
    ///
    /// Concurrent callers are serialized, so at most one `enc_keys` request
    /// is outstanding per pairing.
    pub async fn run_cycle(&self) -> PoolResult<usize> {
        let _guard = self.in_flight.lock().await;

        let reservation = self.buffer.reserve_refill().await?;
        if reservation.is_empty() {
            return Ok(0);
        }
        let needed = reservation.count();

        let partner = self.client.identity().partner_sae_id().to_string();
        debug!(partner = %partner, needed = needed, "Requesting keys from KME");

        // Cancelling this future drops `reservation`, which returns the room
        let request = KeyRequest::new(needed as u32, self.key_size_bits);
        let result = match self.client.request_keys(&request).await {
            Ok(keys) => {
                let received = keys.len();
                let outcome = self
                    .buffer
                    .insert(keys, reservation, KeySource::Refill)
                    .await?;
                if outcome.accepted == 0 {
                    Err(PoolError::Protocol(ProtocolError::MalformedResponse(format!(
                        "KME returned no new keys ({} already held)",
                        outcome.duplicates
                    ))))
                } else {
                    Ok((received, outcome.accepted))
                }
            }
            Err(e) => {
                self.buffer.release(reservation).await?;
                Err(PoolError::from(e))
            }
        };

        match result {
            Ok((received, accepted)) => {
                self.stats.send_modify(|stats| {
                    stats.cycles += 1;
                    stats.successful_cycles += 1;
                    stats.consecutive_failures = 0;
                    stats.keys_requested += needed as u64;
                    stats.keys_received += received as u64;
                    stats.current_backoff = Duration::ZERO;
                    stats.last_error = None;
                });
                info!(partner = %partner, requested = needed, added = accepted, "Key buffer refilled");
                Ok(accepted)
            }
            Err(e) => {
                let backoff = &self.backoff;
                self.stats.send_modify(|stats| {
                    stats.cycles += 1;
                    stats.failed_cycles += 1;
                    stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                    stats.keys_requested += needed as u64;
                    stats.current_backoff = backoff.delay_for_attempt(stats.consecutive_failures);
                    stats.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    /// Refill loop. Wakes on the refill interval or the buffer's low-water
    /// signal; after failures it sleeps for the backoff delay instead.
    /// Returns once `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            partner = self.client.identity().partner_sae_id(),
            interval_secs = self.interval.as_secs(),
            "Refill task started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(_) => {}
                Err(PoolError::ShutDown) => break,
                Err(e) => {
                    let stats = self.stats();
                    if is_retryable(&e) {
                        warn!(
                            error = %e,
                            consecutive_failures = stats.consecutive_failures,
                            delay_ms = stats.current_backoff.as_millis() as u64,
                            "Refill failed, backing off"
                        );
                    } else {
                        error!(
                            error = %e,
                            consecutive_failures = stats.consecutive_failures,
                            delay_ms = stats.current_backoff.as_millis() as u64,
                            "Refill failed with a non-retryable error, backing off"
                        );
                    }
                }
            }

            let backoff = self.stats.borrow().current_backoff;
            let wait = if backoff.is_zero() { self.interval } else { backoff };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.buffer.low_water(), if backoff.is_zero() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Refill task stopped");
    }
}
