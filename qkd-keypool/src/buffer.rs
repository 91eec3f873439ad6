//! Key buffer state and its owning task
//!
//! [`BufferState`] is a plain FIFO of available keys plus the bookkeeping for
//! outstanding requests. A single task owns it and applies [`Command`]s one at
//! a time; everything else talks to that task through a cloneable
//! [`BufferHandle`]. No network I/O ever happens inside the owner.
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


use crate::error::{PoolError, PoolResult};
use chrono::{DateTime, Utc};
use qkd_types::{KeyId, KeyMaterial};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 256;

/// Ids are remembered for this many TTLs after insertion
const SEEN_RETENTION_TTLS: u32 = 2;

/// Refill threshold, hard cap and time-to-live of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub min_keys: usize,
    pub max_keys: usize,
    pub ttl: Duration,
}

impl BufferLimits {
    pub fn new(min_keys: usize, max_keys: usize, ttl: Duration) -> PoolResult<Self> {
        let limits = Self {
            min_keys,
            max_keys,
            ttl,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.max_keys == 0 {
            return Err(PoolError::Configuration(
                "max_keys must be greater than 0".to_string(),
            ));
        }
        if self.min_keys > self.max_keys {
            return Err(PoolError::Configuration(format!(
                "min_keys ({}) must not exceed max_keys ({})",
                self.min_keys, self.max_keys
            )));
        }
        if self.ttl.is_zero() {
            return Err(PoolError::Configuration(
                "ttl must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where inserted keys came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Refill,
    Import,
}

/// Result of handing fetched keys to the buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub accepted: usize,
    /// Ids the buffer had already held
    pub duplicates: usize,
    /// Keys dropped because the buffer was full
    pub overflow: usize,
}

/// Point-in-time view of a buffer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStats {
    pub available: usize,
    pub reserved: usize,
    pub min_keys: usize,
    pub max_keys: usize,
    pub issued_total: u64,
    pub expired_total: u64,
    pub imported_total: u64,
    pub rejected_total: u64,
    pub oldest_key_age: Option<Duration>,
    pub observed_at: DateTime<Utc>,
}

struct Entry {
    key: KeyMaterial,
    inserted_at: Instant,
}

/// FIFO of available keys for one pairing
pub struct BufferState {
    entries: VecDeque<Entry>,
    seen: HashSet<KeyId>,
    // Insertion order of `seen`, oldest first
    seen_order: VecDeque<(Instant, KeyId)>,
    reserved: usize,
    limits: BufferLimits,
    issued_total: u64,
    expired_total: u64,
    imported_total: u64,
    rejected_total: u64,
}

impl BufferState {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            entries: VecDeque::with_capacity(limits.max_keys),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            reserved: 0,
            limits,
            issued_total: 0,
            expired_total: 0,
            imported_total: 0,
            rejected_total: 0,
        }
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Number of ids remembered for duplicate rejection
    pub fn tracked_ids(&self) -> usize {
        self.seen.len()
    }

    pub fn below_low_water(&self) -> bool {
        self.entries.len() < self.limits.min_keys
    }

    /// Hand out the oldest live key, marking it consumed
    pub fn consume(&mut self, now: Instant) -> Option<KeyMaterial> {
        self.evict_expired(now);

        let mut key = self.entries.pop_front()?.key;
        if let Err(e) = key.mark_consumed() {
            // Only Available keys are ever stored
            warn!(error = %e, "Discarding key in unexpected state");
            return None;
        }
        self.issued_total += 1;
        Some(key)
    }

    /// Reserve room for a refill: `min - (available + reserved)`, bounded by
    /// what fits under `max` once outstanding reservations land.
    pub fn reserve_refill(&mut self, now: Instant) -> usize {
        self.evict_expired(now);

        let pending = self.entries.len() + self.reserved;
        let deficit = self.limits.min_keys.saturating_sub(pending);
        let room = self.limits.max_keys.saturating_sub(pending);
        let needed = deficit.min(room);

        self.reserved += needed;
        needed
    }

    /// Reserve room for exactly `count` keys or fail without side effects
    pub fn reserve_exact(&mut self, count: usize, now: Instant) -> PoolResult<()> {
        self.evict_expired(now);

        let free = self
            .limits
            .max_keys
            .saturating_sub(self.entries.len() + self.reserved);
        if count > free {
            return Err(PoolError::CapacityExceeded {
                requested: count,
                available: free,
            });
        }
        self.reserved += count;
        Ok(())
    }

    pub fn release(&mut self, reservation: usize) {
        self.reserved = self.reserved.saturating_sub(reservation);
    }

    /// Insert fetched keys and settle their reservation
    pub fn insert(
        &mut self,
        keys: Vec<KeyMaterial>,
        reservation: usize,
        source: KeySource,
        now: Instant,
    ) -> InsertOutcome {
        self.release(reservation);

        let mut outcome = InsertOutcome::default();
        for key in keys {
            if !key.is_available() || self.seen.contains(key.key_id()) {
                debug!(key_id = key.key_id(), "Rejecting previously held key");
                outcome.duplicates += 1;
                continue;
            }
            if self.entries.len() >= self.limits.max_keys {
                outcome.overflow += 1;
                continue;
            }

            self.seen.insert(key.key_id().to_string());
            self.seen_order.push_back((now, key.key_id().to_string()));
            self.entries.push_back(Entry {
                key,
                inserted_at: now,
            });
            outcome.accepted += 1;
        }

        self.rejected_total += outcome.duplicates as u64;
        if source == KeySource::Import {
            self.imported_total += outcome.accepted as u64;
        }
        if outcome.duplicates > 0 {
            warn!(
                duplicates = outcome.duplicates,
                "Rejected keys whose ID was already held"
            );
        }
        if outcome.overflow > 0 {
            warn!(
                overflow = outcome.overflow,
                max_keys = self.limits.max_keys,
                "Dropped keys beyond buffer capacity"
            );
        }
        outcome
    }

    /// Evict keys older than the TTL; returns how many were evicted
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let ttl = self.limits.ttl;
        let mut evicted = 0;

        // Entries are in insertion order, so expired keys sit at the front
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.inserted_at) < ttl {
                break;
            }
            if let Some(mut entry) = self.entries.pop_front() {
                let _ = entry.key.mark_expired();
                debug!(key_id = entry.key.key_id(), "Key expired");
                evicted += 1;
            }
        }

        self.expired_total += evicted as u64;
        self.forget_old_ids(now);
        evicted
    }

    // Live entries are younger than one TTL, so every id still buffered
    // stays remembered.
    fn forget_old_ids(&mut self, now: Instant) {
        let retention = self.limits.ttl.saturating_mul(SEEN_RETENTION_TTLS);
        while let Some((seen_at, _)) = self.seen_order.front() {
            if now.saturating_duration_since(*seen_at) < retention {
                break;
            }
            if let Some((_, key_id)) = self.seen_order.pop_front() {
                self.seen.remove(&key_id);
            }
        }
    }

    /// Apply new limits; evicts the oldest surplus when `max` shrinks
    pub fn configure(&mut self, limits: BufferLimits, now: Instant) -> PoolResult<usize> {
        limits.validate()?;
        self.limits = limits;

        let mut evicted = self.evict_expired(now);
        while self.entries.len() > limits.max_keys {
            if let Some(mut entry) = self.entries.pop_front() {
                let _ = entry.key.mark_expired();
                self.expired_total += 1;
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    pub fn stats(&self, now: Instant) -> BufferStats {
        BufferStats {
            available: self.entries.len(),
            reserved: self.reserved,
            min_keys: self.limits.min_keys,
            max_keys: self.limits.max_keys,
            issued_total: self.issued_total,
            expired_total: self.expired_total,
            imported_total: self.imported_total,
            rejected_total: self.rejected_total,
            oldest_key_age: self
                .entries
                .front()
                .map(|entry| now.saturating_duration_since(entry.inserted_at)),
            observed_at: Utc::now(),
        }
    }
}

enum Command {
    Consume {
        reply: oneshot::Sender<Option<KeyMaterial>>,
    },
    ReserveRefill {
        reply: oneshot::Sender<usize>,
    },
    ReserveExact {
        count: usize,
        reply: oneshot::Sender<PoolResult<()>>,
    },
    Insert {
        keys: Vec<KeyMaterial>,
        reservation: usize,
        source: KeySource,
        reply: oneshot::Sender<InsertOutcome>,
    },
    Release {
        reservation: usize,
        reply: Option<oneshot::Sender<()>>,
    },
    EvictExpired {
        reply: oneshot::Sender<usize>,
    },
    Configure {
        limits: BufferLimits,
        reply: oneshot::Sender<PoolResult<usize>>,
    },
}

/// Cloneable handle to the buffer owner task
#[derive(Clone)]
pub struct BufferHandle {
    commands: mpsc::Sender<Command>,
    stats: watch::Receiver<BufferStats>,
    low_water: Arc<Notify>,
    key_arrived: Arc<Notify>,
}

impl BufferHandle {
    /// Spawn the owner task. It stops when `shutdown` turns true or every
    /// handle is dropped; remaining keys are wiped on drop.
    pub fn spawn(limits: BufferLimits, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let state = BufferState::new(limits);
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
        let (stats_tx, stats) = watch::channel(state.stats(Instant::now()));
        let low_water = Arc::new(Notify::new());
        let key_arrived = Arc::new(Notify::new());

        let owner = BufferOwner {
            state,
            commands: receiver,
            stats: stats_tx,
            low_water: low_water.clone(),
            key_arrived: key_arrived.clone(),
        };
        let task = tokio::spawn(owner.run(shutdown));

        (
            Self {
                commands,
                stats,
                low_water,
                key_arrived,
            },
            task,
        )
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> PoolResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| PoolError::ShutDown)?;
        response.await.map_err(|_| PoolError::ShutDown)
    }

    pub async fn try_consume(&self) -> PoolResult<Option<KeyMaterial>> {
        self.request(|reply| Command::Consume { reply }).await
    }

    /// Reserve room for a refill; the reservation may hold zero keys
    pub async fn reserve_refill(&self) -> PoolResult<Reservation> {
        let count = self.request(|reply| Command::ReserveRefill { reply }).await?;
        Ok(Reservation::new(count, self.commands.clone()))
    }

    pub async fn reserve_exact(&self, count: usize) -> PoolResult<Reservation> {
        self.request(|reply| Command::ReserveExact { count, reply })
            .await??;
        Ok(Reservation::new(count, self.commands.clone()))
    }

    /// Insert fetched keys, settling `reservation`
    pub async fn insert(
        &self,
        keys: Vec<KeyMaterial>,
        mut reservation: Reservation,
        source: KeySource,
    ) -> PoolResult<InsertOutcome> {
        let (reply, response) = oneshot::channel();
        let command = Command::Insert {
            keys,
            reservation: reservation.count,
            source,
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| PoolError::ShutDown)?;
        // Queued: the owner settles the reservation from here on
        reservation.disarm();
        response.await.map_err(|_| PoolError::ShutDown)
    }

    /// Give back unused room; returns once the owner has applied it
    pub async fn release(&self, mut reservation: Reservation) -> PoolResult<()> {
        let (reply, response) = oneshot::channel();
        let command = Command::Release {
            reservation: reservation.count,
            reply: Some(reply),
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| PoolError::ShutDown)?;
        reservation.disarm();
        response.await.map_err(|_| PoolError::ShutDown)
    }

    pub async fn evict_expired(&self) -> PoolResult<usize> {
        self.request(|reply| Command::EvictExpired { reply }).await
    }

    pub async fn configure(&self, limits: BufferLimits) -> PoolResult<usize> {
        self.request(|reply| Command::Configure { limits, reply })
            .await?
    }

    /// Latest published stats; never waits on the owner
    pub fn stats(&self) -> BufferStats {
        self.stats.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BufferStats> {
        self.stats.clone()
    }

    /// Resolves once the available count drops below `min_keys`
    pub async fn low_water(&self) {
        self.low_water.notified().await
    }

    pub(crate) fn key_arrived(&self) -> &Notify {
        &self.key_arrived
    }
}

struct BufferOwner {
    state: BufferState,
    commands: mpsc::Receiver<Command>,
    stats: watch::Sender<BufferStats>,
    low_water: Arc<Notify>,
    key_arrived: Arc<Notify>,
}

impl BufferOwner {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(
            min_keys = self.state.limits().min_keys,
            max_keys = self.state.limits().max_keys,
            "Key buffer started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            discarded = self.state.len(),
            "Key buffer stopped, remaining keys wiped"
        );
    }

    fn apply(&mut self, command: Command) {
        let now = Instant::now();

        // Stats are published before each reply so a caller that has its
        // answer also sees the matching snapshot.
        match command {
            Command::Consume { reply } => {
                let key = self.state.consume(now);
                self.publish(now, false);
                // A cancelled caller drops the consumed key here; it is wiped,
                // never returned to the buffer.
                let _ = reply.send(key);
            }
            Command::ReserveRefill { reply } => {
                let needed = self.state.reserve_refill(now);
                self.publish(now, false);
                if reply.send(needed).is_err() {
                    self.state.release(needed);
                    self.publish(now, false);
                }
            }
            Command::ReserveExact { count, reply } => {
                let result = self.state.reserve_exact(count, now);
                let reserved = result.is_ok();
                self.publish(now, false);
                if reply.send(result).is_err() && reserved {
                    self.state.release(count);
                    self.publish(now, false);
                }
            }
            Command::Insert {
                keys,
                reservation,
                source,
                reply,
            } => {
                let outcome = self.state.insert(keys, reservation, source, now);
                self.publish(now, outcome.accepted > 0);
                let _ = reply.send(outcome);
            }
            Command::Release { reservation, reply } => {
                self.state.release(reservation);
                self.publish(now, false);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::EvictExpired { reply } => {
                let evicted = self.state.evict_expired(now);
                if evicted > 0 {
                    info!(evicted = evicted, "Evicted expired keys");
                }
                self.publish(now, false);
                let _ = reply.send(evicted);
            }
            Command::Configure { limits, reply } => {
                let result = self.state.configure(limits, now);
                self.publish(now, false);
                let _ = reply.send(result);
            }
        }
    }

    fn publish(&self, now: Instant, arrived: bool) {
        self.stats.send_replace(self.state.stats(now));
        if self.state.below_low_water() {
            self.low_water.notify_one();
        }
        if arrived {
            self.key_arrived.notify_waiters();
        }
    }
}

/// Room held in the buffer for keys still being fetched.
///
/// Settled by [`BufferHandle::insert`] or [`BufferHandle::release`]; dropping
/// it unsettled (for example when the fetching future is cancelled) gives the
/// room back.
#[must_use = "an unsettled reservation is released on drop"]
pub struct Reservation {
    count: usize,
    commands: mpsc::Sender<Command>,
}

impl Reservation {
    fn new(count: usize, commands: mpsc::Sender<Command>) -> Self {
        Self { count, commands }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn disarm(&mut self) {
        self.count = 0;
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").field("count", &self.count).finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.count == 0 {
            return;
        }

        let command = Command::Release {
            reservation: self.count,
            reply: None,
        };
        match self.commands.try_send(command) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(command)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let commands = self.commands.clone();
                    runtime.spawn(async move {
                        let _ = commands.send(command).await;
                    });
                }
                Err(_) => warn!(
                    reservation = self.count,
                    "No runtime to return an abandoned reservation"
                ),
            },
        }
        debug!(reservation = self.count, "Abandoned reservation returned");
    }
}
