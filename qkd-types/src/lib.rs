//! Shared types for the QKD key supply services
//!
//! Domain types (key material, SAE identities, KME status, monitoring
//! records, alert events) and the ETSI GS QKD 014 wire schemas.
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


pub mod error;
pub mod events;
pub mod identity;
pub mod key;
pub mod schemas;
pub mod status;

pub use error::{QkdTypeError, Result};
pub use events::{AlertEvent, AlertKind};
pub use identity::{CredentialPaths, Role, SaeIdentity};
pub use key::{KeyId, KeyMaterial, KeyState};
pub use status::{HealthLevel, MonitoringRecord, StatusSnapshot};
