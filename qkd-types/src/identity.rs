//! SAE identity and pairing role
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
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Role of an SAE within a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Originates key requests (`enc_keys`) and shares key ids with the partner
    #[serde(alias = "alice")]
    Master,
    /// Retrieves keys by id (`dec_keys`)
    #[serde(alias = "bob")]
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

impl FromStr for Role {
    type Err = QkdTypeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" | "alice" => Ok(Role::Master),
            "slave" | "bob" => Ok(Role::Slave),
            other => Err(QkdTypeError::InvalidRole(other.to_string())),
        }
    }
}

/// Client certificate, private key and trusted CA bundle (PEM files)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl CredentialPaths {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>, ca: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            ca: ca.into(),
        }
    }

    /// All credential files, in cert/key/ca order
    pub fn all(&self) -> [&Path; 3] {
        [self.cert.as_path(), self.key.as_path(), self.ca.as_path()]
    }
}

/// Identity of the local SAE and its partner. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaeIdentity {
    sae_id: String,
    role: Role,
    partner_sae_id: String,
    kme_endpoint: String,
    credentials: CredentialPaths,
}

impl SaeIdentity {
    pub fn new(
        sae_id: impl Into<String>,
        role: Role,
        partner_sae_id: impl Into<String>,
        kme_endpoint: impl Into<String>,
        credentials: CredentialPaths,
    ) -> Result<Self> {
        let sae_id = sae_id.into();
        let partner_sae_id = partner_sae_id.into();
        let kme_endpoint = kme_endpoint.into().trim_end_matches('/').to_string();

        if sae_id.trim().is_empty() {
            return Err(QkdTypeError::MissingField("sae_id".to_string()));
        }
        if partner_sae_id.trim().is_empty() {
            return Err(QkdTypeError::MissingField("partner_sae_id".to_string()));
        }
        if sae_id == partner_sae_id {
            return Err(QkdTypeError::Validation(format!(
                "SAE {} cannot be paired with itself",
                sae_id
            )));
        }
        if kme_endpoint.is_empty() {
            return Err(QkdTypeError::MissingField("kme_endpoint".to_string()));
        }

        Ok(Self {
            sae_id,
            role,
            partner_sae_id,
            kme_endpoint,
            credentials,
        })
    }

    pub fn sae_id(&self) -> &str {
        &self.sae_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn partner_sae_id(&self) -> &str {
        &self.partner_sae_id
    }

    /// Base URL of the local KME, without trailing slash
    pub fn kme_endpoint(&self) -> &str {
        &self.kme_endpoint
    }

    pub fn credentials(&self) -> &CredentialPaths {
        &self.credentials
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }
}
