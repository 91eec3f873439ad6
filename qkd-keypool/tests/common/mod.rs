//! In-memory KME used by the key pool tests
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

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use qkd_client::{KeyRequest, KmeClient, ProtocolError, ProtocolResult};
use qkd_keypool::{BackoffPolicy, BufferLimits, PoolConfig};
use qkd_types::{CredentialPaths, KeyId, KeyMaterial, Role, SaeIdentity, StatusSnapshot};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub struct MockKme {
    identity: SaeIdentity,
    next_id: AtomicU64,
    enc_failures: Mutex<VecDeque<ProtocolError>>,
    enc_calls: Mutex<Vec<(Instant, u32)>>,
    dec_calls: Mutex<Vec<Vec<KeyId>>>,
    unknown_ids: Mutex<HashSet<KeyId>>,
    statuses: Mutex<VecDeque<ProtocolResult<u64>>>,
    enc_stall: Mutex<Option<Duration>>,
    dec_stall: Mutex<Option<Duration>>,
}

impl MockKme {
    fn new(role: Role) -> Arc<Self> {
        let (me, partner) = match role {
            Role::Master => ("Alice2", "Bob2"),
            Role::Slave => ("Bob2", "Alice2"),
        };
        let identity = SaeIdentity::new(
            me,
            role,
            partner,
            "https://kme.test",
            CredentialPaths::new("client.crt", "client.key", "ca.crt"),
        )
        .unwrap();

        Arc::new(Self {
            identity,
            next_id: AtomicU64::new(1),
            enc_failures: Mutex::new(VecDeque::new()),
            enc_calls: Mutex::new(Vec::new()),
            dec_calls: Mutex::new(Vec::new()),
            unknown_ids: Mutex::new(HashSet::new()),
            statuses: Mutex::new(VecDeque::new()),
            enc_stall: Mutex::new(None),
            dec_stall: Mutex::new(None),
        })
    }

    pub fn master() -> Arc<Self> {
        Self::new(Role::Master)
    }

    pub fn slave() -> Arc<Self> {
        Self::new(Role::Slave)
    }

    /// Fail the next `times` enc_keys calls with `error`
    pub fn fail_enc_keys(&self, error: ProtocolError, times: usize) {
        let mut failures = self.enc_failures.lock().unwrap();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Make the next enc_keys call hang for `delay` before answering
    pub fn stall_next_enc_keys(&self, delay: Duration) {
        *self.enc_stall.lock().unwrap() = Some(delay);
    }

    /// Make the next dec_keys call hang for `delay` before answering
    pub fn stall_next_dec_keys(&self, delay: Duration) {
        *self.dec_stall.lock().unwrap() = Some(delay);
    }

    /// Start handing out key IDs from the beginning again
    pub fn reuse_ids(&self) {
        self.next_id.store(1, Ordering::SeqCst);
    }

    pub fn forget(&self, key_id: &str) {
        self.unknown_ids.lock().unwrap().insert(key_id.to_string());
    }

    /// Queue a status result (`Ok(stored_key_count)` or an error)
    pub fn push_status(&self, status: ProtocolResult<u64>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn enc_call_times(&self) -> Vec<Instant> {
        self.enc_calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn requested_numbers(&self) -> Vec<u32> {
        self.enc_calls.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }

    pub fn dec_calls(&self) -> Vec<Vec<KeyId>> {
        self.dec_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl KmeClient for MockKme {
    fn identity(&self) -> &SaeIdentity {
        &self.identity
    }

    async fn get_status(&self) -> ProtocolResult<StatusSnapshot> {
        let stored = self.statuses.lock().unwrap().pop_front().unwrap_or(Ok(1000))?;
        Ok(StatusSnapshot {
            source_kme_id: "KME-A".to_string(),
            target_kme_id: "KME-B".to_string(),
            master_sae_id: "Alice2".to_string(),
            slave_sae_id: "Bob2".to_string(),
            key_size: 256,
            stored_key_count: stored,
            max_key_count: 100_000,
            max_key_per_request: 128,
            max_key_size: 1024,
            min_key_size: 64,
            max_sae_id_count: 0,
            observed_at: Utc::now(),
        })
    }

    async fn request_keys(&self, request: &KeyRequest) -> ProtocolResult<Vec<KeyMaterial>> {
        self.enc_calls
            .lock()
            .unwrap()
            .push((Instant::now(), request.number));

        let stall = self.enc_stall.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.enc_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        Ok((0..request.number)
            .map(|_| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                KeyMaterial::new(
                    format!("key-{}", id),
                    vec![(id % 251) as u8; request.size_bits as usize / 8],
                )
            })
            .collect())
    }

    async fn fetch_by_ids(&self, key_ids: &[KeyId]) -> ProtocolResult<Vec<KeyMaterial>> {
        self.dec_calls.lock().unwrap().push(key_ids.to_vec());

        let stall = self.dec_stall.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let unknown = self.unknown_ids.lock().unwrap();
        let missing: Vec<String> = key_ids
            .iter()
            .filter(|id| unknown.contains(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ProtocolError::KeyIdNotFound {
                message: "key_ID not found".to_string(),
                missing,
            });
        }

        Ok(key_ids
            .iter()
            .map(|id| KeyMaterial::new(id.clone(), vec![9; 32]))
            .collect())
    }
}

pub fn pool_config(min_keys: usize, max_keys: usize, ttl: Duration) -> PoolConfig {
    PoolConfig {
        limits: BufferLimits::new(min_keys, max_keys, ttl).unwrap(),
        key_size_bits: 256,
        auto_refill: false,
        refill_interval: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
        backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0),
    }
}

pub fn ids(names: &[&str]) -> Vec<KeyId> {
    names.iter().map(|name| name.to_string()).collect()
}
