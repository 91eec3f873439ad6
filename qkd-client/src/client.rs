//! ETSI GS QKD 014 protocol client
//!
//! Encodes `status`, `enc_keys` and `dec_keys` on top of a [`Transport`],
//! validates every response at the boundary and maps HTTP outcomes to
//! [`ProtocolError`]. Every call is a single attempt.
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


use crate::error::{ProtocolError, ProtocolResult};
use crate::transport::{Method, RawResponse, Transport};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use qkd_types::schemas::{DecKeysRequest, EncKeysRequest, ErrorResponse, KeyContainer, KeyEntry, StatusResponse};
use qkd_types::{KeyId, KeyMaterial, Role, SaeIdentity, StatusSnapshot};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Path prefix of the key delivery API
pub const API_PREFIX: &str = "/api/v1/keys";

/// Parameters of an `enc_keys` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRequest {
    pub number: u32,
    pub size_bits: u32,
    pub additional_slave_sae_ids: Vec<String>,
    pub extension_mandatory: Vec<serde_json::Value>,
    pub extension_optional: Vec<serde_json::Value>,
}

impl KeyRequest {
    pub fn new(number: u32, size_bits: u32) -> Self {
        Self {
            number,
            size_bits,
            ..Default::default()
        }
    }

    pub fn with_additional_slave(mut self, sae_id: impl Into<String>) -> Self {
        self.additional_slave_sae_ids.push(sae_id.into());
        self
    }

    pub fn with_mandatory_extension(mut self, extension: serde_json::Value) -> Self {
        self.extension_mandatory.push(extension);
        self
    }

    pub fn with_optional_extension(mut self, extension: serde_json::Value) -> Self {
        self.extension_optional.push(extension);
        self
    }

    /// Plain `number`/`size` requests go as GET query parameters; anything
    /// else needs the POST body form.
    pub fn needs_body(&self) -> bool {
        !self.additional_slave_sae_ids.is_empty()
            || !self.extension_mandatory.is_empty()
            || !self.extension_optional.is_empty()
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.number == 0 {
            return Err(ProtocolError::InvalidParameter(
                "number must be a positive integer".to_string(),
            ));
        }
        if self.size_bits == 0 || self.size_bits % 8 != 0 {
            return Err(ProtocolError::InvalidParameter(format!(
                "size must be a positive multiple of 8, got {}",
                self.size_bits
            )));
        }
        if self.additional_slave_sae_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(ProtocolError::InvalidParameter(
                "additional_slave_SAE_IDs must not contain empty ids".to_string(),
            ));
        }
        Ok(())
    }

    fn to_body(&self) -> EncKeysRequest {
        EncKeysRequest {
            number: Some(self.number),
            size: Some(self.size_bits),
            additional_slave_sae_ids: self.additional_slave_sae_ids.clone(),
            extension_mandatory: self.extension_mandatory.clone(),
            extension_optional: self.extension_optional.clone(),
        }
    }
}

/// Key delivery operations against the local KME, for one pairing
#[async_trait]
pub trait KmeClient: Send + Sync {
    /// Identity (and therefore partner and role) this client is bound to
    fn identity(&self) -> &SaeIdentity;

    /// Status of the link to the partner SAE
    async fn get_status(&self) -> ProtocolResult<StatusSnapshot>;

    /// Obtain new keys shared with the partner (master only)
    async fn request_keys(&self, request: &KeyRequest) -> ProtocolResult<Vec<KeyMaterial>>;

    /// Retrieve keys the partner already obtained, by id (slave only).
    /// The result is in request order.
    async fn fetch_by_ids(&self, key_ids: &[KeyId]) -> ProtocolResult<Vec<KeyMaterial>>;
}

/// [`KmeClient`] speaking ETSI GS QKD 014 over any [`Transport`]
pub struct EtsiClient<T: Transport> {
    transport: T,
    identity: SaeIdentity,
}

impl<T: Transport> EtsiClient<T> {
    pub fn new(transport: T, identity: SaeIdentity) -> Self {
        Self { transport, identity }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn path(&self, operation: &str) -> String {
        format!(
            "{}/{}/{}",
            API_PREFIX,
            self.identity.partner_sae_id(),
            operation
        )
    }

    fn require_role(&self, role: Role, operation: &str) -> ProtocolResult<()> {
        if self.identity.role() != role {
            return Err(ProtocolError::RoleMismatch(format!(
                "{} is only available to {} SAEs, {} is {}",
                operation,
                role,
                self.identity.sae_id(),
                self.identity.role()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> KmeClient for EtsiClient<T> {
    fn identity(&self) -> &SaeIdentity {
        &self.identity
    }

    async fn get_status(&self) -> ProtocolResult<StatusSnapshot> {
        let response = self
            .transport
            .send(Method::Get, &self.path("status"), &[], None)
            .await?;
        if !response.is_success() {
            return Err(error_from_response(&response));
        }

        let body: StatusResponse = decode_json(&response)?;
        let snapshot = StatusSnapshot::from_response(body, Utc::now())
            .map_err(|e| ProtocolError::MalformedResponse(e.to_string()))?;

        let reported_partner = match self.identity.role() {
            Role::Master => &snapshot.slave_sae_id,
            Role::Slave => &snapshot.master_sae_id,
        };
        if reported_partner != self.identity.partner_sae_id() {
            warn!(
                expected = self.identity.partner_sae_id(),
                reported = %reported_partner,
                "KME status names a different partner SAE"
            );
        }

        debug!(
            partner = self.identity.partner_sae_id(),
            stored_key_count = snapshot.stored_key_count,
            "KME status received"
        );
        Ok(snapshot)
    }

    async fn request_keys(&self, request: &KeyRequest) -> ProtocolResult<Vec<KeyMaterial>> {
        self.require_role(Role::Master, "enc_keys")?;
        request.validate()?;

        let path = self.path("enc_keys");
        let response = if request.needs_body() {
            let body = serde_json::to_value(request.to_body())
                .map_err(|e| ProtocolError::InvalidParameter(e.to_string()))?;
            self.transport
                .send(Method::Post, &path, &[], Some(&body))
                .await?
        } else {
            let query = [
                ("number".to_string(), request.number.to_string()),
                ("size".to_string(), request.size_bits.to_string()),
            ];
            self.transport.send(Method::Get, &path, &query, None).await?
        };

        if !response.is_success() {
            return Err(error_from_response(&response));
        }

        let container: KeyContainer = decode_json(&response)?;
        if container.keys.len() != request.number as usize {
            return Err(ProtocolError::MalformedResponse(format!(
                "requested {} keys, KME returned {}",
                request.number,
                container.keys.len()
            )));
        }

        let keys = decode_keys(container.keys)?;
        if let Some(bad) = keys
            .iter()
            .find(|key| key.size_bits() != request.size_bits as usize)
        {
            return Err(ProtocolError::MalformedResponse(format!(
                "requested {}-bit keys, KME returned a {}-bit key",
                request.size_bits,
                bad.size_bits()
            )));
        }

        debug!(
            partner = self.identity.partner_sae_id(),
            count = keys.len(),
            size_bits = request.size_bits,
            "Keys obtained from KME"
        );
        Ok(keys)
    }

    async fn fetch_by_ids(&self, key_ids: &[KeyId]) -> ProtocolResult<Vec<KeyMaterial>> {
        self.require_role(Role::Slave, "dec_keys")?;

        if key_ids.is_empty() {
            return Err(ProtocolError::InvalidParameter(
                "at least one key_ID is required".to_string(),
            ));
        }
        let mut unique = HashSet::with_capacity(key_ids.len());
        for id in key_ids {
            if id.trim().is_empty() {
                return Err(ProtocolError::InvalidParameter(
                    "key_ID must not be empty".to_string(),
                ));
            }
            if !unique.insert(id.as_str()) {
                return Err(ProtocolError::InvalidParameter(format!(
                    "key_ID {} requested more than once",
                    id
                )));
            }
        }

        let path = self.path("dec_keys");
        let response = if let [single] = key_ids {
            let query = [("key_ID".to_string(), single.clone())];
            self.transport.send(Method::Get, &path, &query, None).await?
        } else {
            let body = serde_json::to_value(DecKeysRequest::new(key_ids.iter().cloned()))
                .map_err(|e| ProtocolError::InvalidParameter(e.to_string()))?;
            self.transport
                .send(Method::Post, &path, &[], Some(&body))
                .await?
        };

        if !response.is_success() {
            return Err(dec_keys_error(&response, key_ids));
        }

        let container: KeyContainer = decode_json(&response)?;
        let mut by_id: HashMap<String, KeyMaterial> = decode_keys(container.keys)?
            .into_iter()
            .map(|key| (key.key_id().to_string(), key))
            .collect();

        let mut ordered = Vec::with_capacity(key_ids.len());
        let mut missing = Vec::new();
        for id in key_ids {
            match by_id.remove(id) {
                Some(key) => ordered.push(key),
                None => missing.push(id.clone()),
            }
        }

        if !by_id.is_empty() {
            return Err(ProtocolError::MalformedResponse(format!(
                "KME returned {} key(s) that were not requested",
                by_id.len()
            )));
        }

        if !missing.is_empty() {
            // Partial results are discarded; the dropped keys are wiped.
            warn!(
                partner = self.identity.partner_sae_id(),
                requested = key_ids.len(),
                returned = ordered.len(),
                "KME resolved only part of the requested key IDs"
            );
            return Err(ProtocolError::KeyIdNotFound {
                message: format!(
                    "KME returned {} of {} requested keys",
                    ordered.len(),
                    key_ids.len()
                ),
                missing,
            });
        }

        debug!(
            partner = self.identity.partner_sae_id(),
            count = ordered.len(),
            "Keys retrieved by ID"
        );
        Ok(ordered)
    }
}

fn decode_json<D: DeserializeOwned>(response: &RawResponse) -> ProtocolResult<D> {
    serde_json::from_slice(&response.body)
        .map_err(|e| ProtocolError::MalformedResponse(format!("invalid JSON body: {}", e)))
}

fn decode_keys(entries: Vec<KeyEntry>) -> ProtocolResult<Vec<KeyMaterial>> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut keys = Vec::with_capacity(entries.len());

    for entry in entries {
        if entry.key_id.trim().is_empty() {
            return Err(ProtocolError::MalformedResponse(
                "key entry without key_ID".to_string(),
            ));
        }
        if !seen.insert(entry.key_id.clone()) {
            return Err(ProtocolError::MalformedResponse(format!(
                "duplicate key_ID {} in response",
                entry.key_id
            )));
        }

        let raw = STANDARD.decode(entry.key.as_bytes()).map_err(|e| {
            ProtocolError::MalformedResponse(format!(
                "key {} is not valid base64: {}",
                entry.key_id, e
            ))
        })?;
        if raw.is_empty() {
            return Err(ProtocolError::MalformedResponse(format!(
                "key {} is empty",
                entry.key_id
            )));
        }

        keys.push(KeyMaterial::new(entry.key_id, raw));
    }

    Ok(keys)
}

struct ErrorBody {
    message: String,
    details: Vec<serde_json::Value>,
}

fn parse_error_body(body: &[u8]) -> ErrorBody {
    if let Ok(parsed) = serde_json::from_slice::<ErrorResponse>(body) {
        return ErrorBody {
            message: parsed.message,
            details: parsed.details,
        };
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let message = if text.is_empty() {
        "no error message".to_string()
    } else {
        text.chars().take(200).collect()
    };
    ErrorBody {
        message,
        details: Vec::new(),
    }
}

fn error_from_response(response: &RawResponse) -> ProtocolError {
    let ErrorBody { message, .. } = parse_error_body(&response.body);
    match response.status {
        400 => ProtocolError::InvalidParameter(message),
        401 => ProtocolError::AuthenticationFailed(message),
        503 => ProtocolError::ServiceUnavailable(message),
        status => ProtocolError::UnexpectedStatus { status, message },
    }
}

/// `dec_keys` failures that name unknown or expired ids become `KeyIdNotFound`
fn dec_keys_error(response: &RawResponse, requested: &[KeyId]) -> ProtocolError {
    if !matches!(response.status, 400 | 404) {
        return error_from_response(response);
    }

    let ErrorBody { message, details } = parse_error_body(&response.body);
    let details_text = details
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(" ");

    let missing: Vec<String> = {
        let mentioned: HashSet<&str> = id_tokens(&message).chain(id_tokens(&details_text)).collect();
        requested
            .iter()
            .filter(|id| mentioned.contains(id.as_str()))
            .cloned()
            .collect()
    };

    let lower = message.to_lowercase();
    let about_ids = lower.contains("not found")
        || lower.contains("unknown")
        || lower.contains("expired")
        || lower.contains("does not exist");

    if missing.is_empty() && !about_ids {
        return error_from_response(response);
    }

    ProtocolError::KeyIdNotFound { message, missing }
}

/// Words of an error message that could be key IDs
fn id_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| {
        c.is_whitespace() || matches!(c, '"' | '\'' | ',' | ';' | ':' | '[' | ']' | '{' | '}' | '(' | ')')
    })
    .map(|token| token.trim_end_matches('.'))
    .filter(|token| !token.is_empty())
}
