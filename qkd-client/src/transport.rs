//! Mutually authenticated HTTPS transport to a single KME
//!
//! The transport performs exactly one request per call. It does not retry and
//! does not interpret payloads; callers receive the status code and raw body.
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


use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use qkd_config::NodeConfig;
use qkd_types::{CredentialPaths, SaeIdentity};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// Status code and undecoded body of one HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request/response primitive bound to one KME endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Base URL every request path is appended to
    fn endpoint(&self) -> &str;

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&serde_json::Value>,
    ) -> TransportResult<RawResponse>;
}

/// Settings for [`HttpsTransport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: String,
    pub credentials: CredentialPaths,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl TransportConfig {
    pub fn new(identity: &SaeIdentity, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            endpoint: identity.kme_endpoint().to_string(),
            credentials: identity.credentials().clone(),
            connect_timeout,
            request_timeout,
        }
    }

    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            credentials: config.credentials(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// reqwest/rustls transport presenting a client certificate and trusting only
/// the configured CA bundle. Hostname verification is always on.
pub struct HttpsTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpsTransport {
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let cert = read_pem(&config.credentials.cert, "client certificate")?;
        let key = read_pem(&config.credentials.key, "private key")?;
        let ca = read_pem(&config.credentials.ca, "CA bundle")?;

        let mut identity_pem = cert;
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&key);

        let identity = reqwest::Identity::from_pem(&identity_pem).map_err(|e| {
            TransportError::Configuration(format!("Invalid client certificate or key: {}", e))
        })?;
        let ca_cert = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| TransportError::Configuration(format!("Invalid CA bundle: {}", e)))?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca_cert)
            .identity(identity)
            .https_only(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                TransportError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&serde_json::Value>,
    ) -> TransportResult<RawResponse> {
        let url = format!("{}{}", self.endpoint, path);

        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify_error)?.to_vec();

        debug!(%method, path = path, status = status, bytes = body.len(), "KME request completed");

        Ok(RawResponse { status, body })
    }
}

fn read_pem(path: &Path, what: &str) -> TransportResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        TransportError::Configuration(format!("Cannot read {} {}: {}", what, path.display(), e))
    })
}

/// Map a reqwest failure onto the transport taxonomy.
///
/// reqwest only exposes `is_timeout` / `is_connect`; DNS and TLS failures are
/// recognised from the wrapped hyper/rustls errors in the source chain.
fn classify_error(err: reqwest::Error) -> TransportError {
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    classify(err.is_timeout(), chain)
}

pub(crate) fn classify(timed_out: bool, chain: String) -> TransportError {
    let lower = chain.to_lowercase();

    if timed_out || lower.contains("timed out") || lower.contains("deadline has elapsed") {
        TransportError::Timeout(chain)
    } else if lower.contains("dns")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        TransportError::Dns(chain)
    } else if lower.contains("certificate")
        || lower.contains("tls")
        || lower.contains("handshake")
        || lower.contains("unknownissuer")
    {
        TransportError::TlsVerificationFailed(chain)
    } else {
        TransportError::ConnectionRefused(chain)
    }
}
