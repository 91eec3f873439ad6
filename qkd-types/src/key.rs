//! Key material delivered by a KME
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
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Opaque key identifier assigned by the KME (`key_ID` on the wire)
pub type KeyId = String;

/// Lifecycle state of a piece of key material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    /// Held by a buffer, not yet handed out
    Available,
    /// Handed out to exactly one caller (terminal)
    Consumed,
    /// Discarded after exceeding its time-to-live (terminal)
    Expired,
}

/// One key delivered by the KME.
///
/// The raw bytes are wiped from memory when the value is dropped and never
/// appear in `Debug` output. Not `Clone`: a key has a single owner until it
/// is consumed or expires.
pub struct KeyMaterial {
    key_id: KeyId,
    raw_key: Zeroizing<Vec<u8>>,
    size_bits: usize,
    acquired_at: DateTime<Utc>,
    state: KeyState,
}

impl KeyMaterial {
    /// Create freshly acquired key material in the `Available` state
    pub fn new(key_id: impl Into<KeyId>, raw_key: Vec<u8>) -> Self {
        Self::with_acquired_at(key_id, raw_key, Utc::now())
    }

    /// Create key material with an explicit acquisition timestamp
    pub fn with_acquired_at(
        key_id: impl Into<KeyId>,
        raw_key: Vec<u8>,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        let size_bits = raw_key.len() * 8;
        Self {
            key_id: key_id.into(),
            raw_key: Zeroizing::new(raw_key),
            size_bits,
            acquired_at,
            state: KeyState::Available,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn raw_key(&self) -> &[u8] {
        &self.raw_key
    }

    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.state == KeyState::Available
    }

    /// Age relative to `now`, zero if the clock went backwards
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.acquired_at).max(chrono::Duration::zero())
    }

    /// Transition `Available -> Consumed`. Happens exactly once.
    pub fn mark_consumed(&mut self) -> Result<()> {
        self.transition(KeyState::Consumed)
    }

    /// Transition `Available -> Expired`
    pub fn mark_expired(&mut self) -> Result<()> {
        self.transition(KeyState::Expired)
    }

    fn transition(&mut self, to: KeyState) -> Result<()> {
        if self.state != KeyState::Available {
            return Err(QkdTypeError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("raw_key", &"<redacted>")
            .field("size_bits", &self.size_bits)
            .field("acquired_at", &self.acquired_at)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_key_is_available() {
        let key = KeyMaterial::new("k1", vec![0xAB; 32]);
        assert_eq!(key.key_id(), "k1");
        assert_eq!(key.size_bits(), 256);
        assert_eq!(key.state(), KeyState::Available);
        assert!(key.is_available());
    }

    #[test]
    fn test_consume_happens_once() {
        let mut key = KeyMaterial::new("k1", vec![1; 16]);
        assert!(key.mark_consumed().is_ok());
        assert_eq!(key.state(), KeyState::Consumed);

        let err = key.mark_consumed().unwrap_err();
        assert_eq!(
            err,
            QkdTypeError::InvalidTransition {
                from: KeyState::Consumed,
                to: KeyState::Consumed,
            }
        );
        // Expiry cannot revive or overwrite a consumed key either
        assert!(key.mark_expired().is_err());
        assert_eq!(key.state(), KeyState::Consumed);
    }

    #[test]
    fn test_debug_redacts_key_bytes() {
        let key = KeyMaterial::new("k-debug", vec![0x42; 8]);
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("k-debug"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("[66"));
    }

    #[test]
    fn test_age_never_negative() {
        let now = Utc::now();
        let key = KeyMaterial::with_acquired_at("k1", vec![1], now + chrono::Duration::seconds(5));
        assert_eq!(key.age_at(now), chrono::Duration::zero());
        assert_eq!(
            key.age_at(now + chrono::Duration::seconds(15)),
            chrono::Duration::seconds(10)
        );
    }
}
