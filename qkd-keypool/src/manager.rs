//! Application-facing key supply for one pairing
//!
//! `KeyBufferManager` owns the buffer task, the periodic TTL cleanup and,
//! for master pairings, the refill task. Keys handed out by [`consume`] are
//! never issued to a second caller.
//!
//! [`consume`]: KeyBufferManager::consume
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


use crate::backoff::BackoffPolicy;
use crate::buffer::{BufferHandle, BufferLimits, BufferStats, KeySource};
use crate::error::{PoolError, PoolResult};
use crate::refill::{RefillStats, RefillWorker};
use qkd_client::{KmeClient, ProtocolError};
use qkd_config::NodeConfig;
use qkd_types::{KeyId, KeyMaterial, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Buffer manager configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub limits: BufferLimits,
    pub key_size_bits: u32,
    /// Spawn the background refill task (master only)
    pub auto_refill: bool,
    pub refill_interval: Duration,
    pub cleanup_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl PoolConfig {
    pub fn from_node_config(config: &NodeConfig) -> PoolResult<Self> {
        Ok(Self {
            limits: BufferLimits::new(config.min_keys, config.max_keys, config.key_ttl())?,
            key_size_bits: config.key_size_bits,
            auto_refill: config.auto_refill,
            refill_interval: config.refill_interval(),
            cleanup_interval: config.cleanup_interval(),
            backoff: BackoffPolicy::from_config(config),
        })
    }
}

pub struct KeyBufferManager {
    client: Arc<dyn KmeClient>,
    buffer: BufferHandle,
    refill: Option<Arc<RefillWorker>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl KeyBufferManager {
    /// Validate the configuration and start the background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(client: Arc<dyn KmeClient>, config: PoolConfig) -> PoolResult<Self> {
        config.limits.validate()?;
        if config.key_size_bits == 0 || config.key_size_bits % 8 != 0 {
            return Err(PoolError::Configuration(format!(
                "key size must be a positive multiple of 8, got {}",
                config.key_size_bits
            )));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (buffer, buffer_task) = BufferHandle::spawn(config.limits, shutdown_rx.clone());

        let mut tasks = vec![("buffer", buffer_task)];
        tasks.push((
            "cleanup",
            tokio::spawn(cleanup_loop(
                buffer.clone(),
                config.cleanup_interval,
                shutdown_rx.clone(),
            )),
        ));

        let role = client.identity().role();
        let refill = match role {
            Role::Master => {
                let worker = Arc::new(RefillWorker::new(
                    client.clone(),
                    buffer.clone(),
                    config.key_size_bits,
                    config.backoff.clone(),
                    config.refill_interval,
                ));
                if config.auto_refill {
                    tasks.push(("refill", tokio::spawn(worker.clone().run(shutdown_rx))));
                }
                Some(worker)
            }
            Role::Slave => None,
        };

        info!(
            sae_id = client.identity().sae_id(),
            partner = client.identity().partner_sae_id(),
            role = %role,
            min_keys = config.limits.min_keys,
            max_keys = config.limits.max_keys,
            ttl_secs = config.limits.ttl.as_secs(),
            auto_refill = config.auto_refill && refill.is_some(),
            "Key buffer manager started"
        );

        Ok(Self {
            client,
            buffer,
            refill,
            shutdown,
            tasks,
        })
    }

    pub fn role(&self) -> Role {
        self.client.identity().role()
    }

    /// Take the oldest available key, or fail immediately with
    /// `BufferExhausted`
    pub async fn consume(&self, purpose: &str) -> PoolResult<KeyMaterial> {
        match self.buffer.try_consume().await? {
            Some(key) => {
                debug!(purpose = purpose, key_id = key.key_id(), "Key issued");
                Ok(key)
            }
            None => {
                warn!(purpose = purpose, "Key buffer exhausted");
                Err(PoolError::BufferExhausted)
            }
        }
    }

    /// Like [`consume`](Self::consume), but waits up to `wait` for keys to
    /// arrive
    pub async fn consume_within(&self, purpose: &str, wait: Duration) -> PoolResult<KeyMaterial> {
        let deadline = Instant::now() + wait;

        loop {
            // Register before checking so an arrival in between is not missed
            let arrived = self.buffer.key_arrived().notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(key) = self.buffer.try_consume().await? {
                debug!(purpose = purpose, key_id = key.key_id(), "Key issued");
                return Ok(key);
            }

            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                warn!(
                    purpose = purpose,
                    wait_ms = wait.as_millis() as u64,
                    "No key arrived in time"
                );
                return Err(PoolError::BufferExhausted);
            }
        }
    }

    /// Retrieve keys the partner announced and add them to the buffer
    /// (slave only). Returns the number of keys added.
    pub async fn import_external_keys(&self, key_ids: &[KeyId]) -> PoolResult<usize> {
        if self.role() != Role::Slave {
            return Err(PoolError::RoleMismatch(
                "importing keys by ID is only available to slave SAEs".to_string(),
            ));
        }
        if key_ids.is_empty() {
            return Err(PoolError::Protocol(ProtocolError::InvalidParameter(
                "at least one key_ID is required".to_string(),
            )));
        }

        // Dropped unsettled if this future is cancelled mid-fetch
        let reservation = self.buffer.reserve_exact(key_ids.len()).await?;

        match self.client.fetch_by_ids(key_ids).await {
            Ok(keys) => {
                let outcome = self
                    .buffer
                    .insert(keys, reservation, KeySource::Import)
                    .await?;
                info!(
                    partner = self.client.identity().partner_sae_id(),
                    requested = key_ids.len(),
                    added = outcome.accepted,
                    duplicates = outcome.duplicates,
                    "Imported keys"
                );
                Ok(outcome.accepted)
            }
            Err(e) => {
                self.buffer.release(reservation).await?;
                warn!(error = %e, requested = key_ids.len(), "Key import failed");
                Err(e.into())
            }
        }
    }

    /// Run one refill cycle now (master only); returns the number of keys
    /// added
    pub async fn refill_now(&self) -> PoolResult<usize> {
        match &self.refill {
            Some(worker) => worker.run_cycle().await,
            None => Err(PoolError::RoleMismatch(
                "refill is only available to master SAEs".to_string(),
            )),
        }
    }

    /// Change thresholds and TTL; returns the number of keys evicted
    pub async fn configure(&self, min_keys: usize, max_keys: usize, ttl: Duration) -> PoolResult<usize> {
        let limits = BufferLimits::new(min_keys, max_keys, ttl)?;
        let evicted = self.buffer.configure(limits).await?;
        info!(
            min_keys = min_keys,
            max_keys = max_keys,
            ttl_secs = ttl.as_secs(),
            evicted = evicted,
            "Key buffer reconfigured"
        );
        Ok(evicted)
    }

    /// Evict keys older than the TTL now; returns the number evicted
    pub async fn cleanup_expired(&self) -> PoolResult<usize> {
        self.buffer.evict_expired().await
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn subscribe(&self) -> watch::Receiver<BufferStats> {
        self.buffer.subscribe()
    }

    pub fn refill_stats(&self) -> Option<RefillStats> {
        self.refill.as_ref().map(|worker| worker.stats())
    }

    /// Stop all background tasks, waiting at most `timeout` in total.
    /// Tasks still running after that are aborted.
    pub async fn shutdown(self, timeout: Duration) {
        info!("Shutting down key buffer manager");
        let _ = self.shutdown.send(true);

        let deadline = Instant::now() + timeout;
        for (name, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Shutdown timeout reached, aborting task");
                    task.abort();
                }
            }
        }

        info!("Key buffer manager stopped");
    }
}

async fn cleanup_loop(buffer: BufferHandle, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(PoolError::ShutDown) = buffer.evict_expired().await {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
