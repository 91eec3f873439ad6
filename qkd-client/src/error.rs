//! Error types for the KME client
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


use thiserror::Error;

/// Failures below HTTP: the request never produced a status code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("TLS verification failed: {0}")]
    TlsVerificationFailed(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Invalid transport configuration: {0}")]
    Configuration(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Outcome of an ETSI operation that did not yield key material or status
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("KME service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Key IDs not found ({missing:?}): {message}")]
    KeyIdNotFound { message: String, missing: Vec<String> },

    #[error("KME unreachable: {0}")]
    NodeUnreachable(#[from] TransportError),

    #[error("Malformed KME response: {0}")]
    MalformedResponse(String),

    #[error("Unexpected HTTP status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Operation not permitted for this role: {0}")]
    RoleMismatch(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
