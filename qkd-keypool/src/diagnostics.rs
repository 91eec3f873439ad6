//! Connectivity and credential diagnostics
//!
//! Each check is independent and runs concurrently under its own timeout:
//! - client certificate / CA bundle: present, parseable, within validity
//! - private key: present, PEM encoded, not readable by group or others
//! - DNS: the KME host resolves
//! - TCP: the KME port accepts connections
//! - TLS: a mutually authenticated handshake completes
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


use chrono::{DateTime, Utc};
use qkd_client::{HttpsTransport, Method, Transport, TransportConfig, TransportError};
use reqwest::Url;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{info, warn};

/// Certificates expiring within this window pass with a warning detail
const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
    /// What to do about a failed check
    pub remediation: Option<String>,
    pub duration: Duration,
}

impl DiagnosticCheck {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
            remediation: None,
            duration: Duration::ZERO,
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
            remediation: Some(remediation.into()),
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    pub checks: Vec<DiagnosticCheck>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DiagnosticCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }

    pub fn check(&self, name: &str) -> Option<&DiagnosticCheck> {
        self.checks.iter().find(|check| check.name == name)
    }

    pub fn log_summary(&self) {
        if self.passed() {
            info!(endpoint = %self.endpoint, checks = self.checks.len(), "Diagnostics passed");
            return;
        }
        for check in self.failures() {
            warn!(
                check = check.name,
                detail = %check.detail,
                remediation = check.remediation.as_deref().unwrap_or(""),
                "Diagnostic check failed"
            );
        }
    }
}

/// Runs all checks against one KME endpoint with one credential bundle
#[derive(Debug, Clone)]
pub struct DiagnosticSuite {
    transport: TransportConfig,
    check_timeout: Duration,
}

impl DiagnosticSuite {
    pub fn new(transport: TransportConfig, check_timeout: Duration) -> Self {
        Self {
            transport,
            check_timeout,
        }
    }

    pub async fn run(&self) -> DiagnosticReport {
        let started_at = Utc::now();
        let credentials = &self.transport.credentials;

        let (certificate, private_key, ca_bundle, dns, tcp, tls) = futures::join!(
            self.timed(
                "client_certificate",
                check_certificate_file("client_certificate", &credentials.cert)
            ),
            self.timed("private_key", check_private_key(&credentials.key)),
            self.timed("ca_bundle", check_certificate_file("ca_bundle", &credentials.ca)),
            self.timed("dns", check_dns(&self.transport.endpoint)),
            self.timed("tcp", check_tcp(&self.transport.endpoint)),
            self.timed("tls", check_tls(self.transport.clone())),
        );

        DiagnosticReport {
            endpoint: self.transport.endpoint.clone(),
            started_at,
            checks: vec![certificate, private_key, ca_bundle, dns, tcp, tls],
        }
    }

    async fn timed<F>(&self, name: &'static str, check: F) -> DiagnosticCheck
    where
        F: Future<Output = DiagnosticCheck>,
    {
        let started = Instant::now();
        let mut result = match tokio::time::timeout(self.check_timeout, check).await {
            Ok(result) => result,
            Err(_) => DiagnosticCheck::fail(
                name,
                format!("check timed out after {:?}", self.check_timeout),
                "Verify network connectivity to the KME and firewall rules",
            ),
        };
        result.duration = started.elapsed();
        result
    }
}

async fn check_certificate_file(name: &'static str, path: &Path) -> DiagnosticCheck {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return DiagnosticCheck::fail(
                name,
                format!("cannot read {}: {}", path.display(), e),
                "Install the certificate issued for this SAE and check the configured path",
            )
        }
    };

    let blocks = match pem::parse_many(&bytes) {
        Ok(blocks) => blocks,
        Err(e) => {
            return DiagnosticCheck::fail(
                name,
                format!("{} is not valid PEM: {}", path.display(), e),
                "Re-export the certificate in PEM format",
            )
        }
    };

    let now = Utc::now().timestamp();
    let mut certificates = 0;
    let mut notes = Vec::new();
    for block in blocks.iter().filter(|block| block.tag() == "CERTIFICATE") {
        certificates += 1;
        let (_, cert) = match x509_parser::parse_x509_certificate(block.contents()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return DiagnosticCheck::fail(
                    name,
                    format!("{} contains an unparseable certificate: {}", path.display(), e),
                    "Re-issue the certificate",
                )
            }
        };

        let validity = cert.validity();
        match assess_validity(
            validity.not_before.timestamp(),
            validity.not_after.timestamp(),
            now,
        ) {
            Ok(note) => notes.push(format!("{}: {}", cert.subject(), note)),
            Err(problem) => {
                return DiagnosticCheck::fail(
                    name,
                    format!("{}: {}", cert.subject(), problem),
                    "Renew the certificate with the issuing CA",
                )
            }
        }
    }

    if certificates == 0 {
        return DiagnosticCheck::fail(
            name,
            format!("{} contains no certificates", path.display()),
            "Check that the path points to a certificate, not a key",
        );
    }

    DiagnosticCheck::pass(name, notes.join("; "))
}

/// Validity window check on unix timestamps
fn assess_validity(not_before: i64, not_after: i64, now: i64) -> Result<String, String> {
    if now < not_before {
        return Err("certificate is not yet valid".to_string());
    }
    if now >= not_after {
        return Err(format!(
            "certificate expired {} days ago",
            (now - not_after) / 86_400
        ));
    }

    let days_left = (not_after - now) / 86_400;
    if days_left < EXPIRY_WARNING_DAYS {
        Ok(format!("valid, expires in {} days", days_left))
    } else {
        Ok(format!("valid for {} more days", days_left))
    }
}

async fn check_private_key(path: &Path) -> DiagnosticCheck {
    const NAME: &str = "private_key";

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            return DiagnosticCheck::fail(
                NAME,
                format!("cannot access {}: {}", path.display(), e),
                "Install the private key for this SAE and check the configured path",
            )
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return DiagnosticCheck::fail(
                NAME,
                format!("{} has permissions {:o}", path.display(), mode & 0o777),
                format!("chmod 600 {}", path.display()),
            );
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => zeroize::Zeroizing::new(bytes),
        Err(e) => {
            return DiagnosticCheck::fail(
                NAME,
                format!("cannot read {}: {}", path.display(), e),
                "Check file ownership of the private key",
            )
        }
    };

    match pem::parse(&*bytes) {
        Ok(block) if block.tag().ends_with("PRIVATE KEY") => {
            DiagnosticCheck::pass(NAME, format!("{} present ({})", path.display(), block.tag()))
        }
        Ok(block) => DiagnosticCheck::fail(
            NAME,
            format!("{} holds a {} block, not a private key", path.display(), block.tag()),
            "Point the key path at the PEM private key",
        ),
        Err(e) => DiagnosticCheck::fail(
            NAME,
            format!("{} is not valid PEM: {}", path.display(), e),
            "Re-export the private key in PEM format",
        ),
    }
}

fn host_and_port(endpoint: &str) -> Result<(String, u16), String> {
    let url = Url::parse(endpoint).map_err(|e| format!("invalid endpoint {}: {}", endpoint, e))?;
    let host = url
        .host_str()
        .ok_or_else(|| format!("endpoint {} has no host", endpoint))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port_or_known_default().unwrap_or(443);
    Ok((host, port))
}

async fn check_dns(endpoint: &str) -> DiagnosticCheck {
    const NAME: &str = "dns";

    let (host, port) = match host_and_port(endpoint) {
        Ok(target) => target,
        Err(e) => return DiagnosticCheck::fail(NAME, e, "Fix the configured KME endpoint"),
    };

    let lookup = tokio::net::lookup_host((host.as_str(), port)).await;
    match lookup {
        Ok(addrs) => {
            let addrs: Vec<String> = addrs.map(|addr| addr.ip().to_string()).collect();
            if addrs.is_empty() {
                DiagnosticCheck::fail(
                    NAME,
                    format!("{} resolved to no addresses", host),
                    "Check DNS records for the KME host",
                )
            } else {
                DiagnosticCheck::pass(NAME, format!("{} -> {}", host, addrs.join(", ")))
            }
        }
        Err(e) => DiagnosticCheck::fail(
            NAME,
            format!("cannot resolve {}: {}", host, e),
            "Check DNS configuration or use the KME's IP address",
        ),
    }
}

async fn check_tcp(endpoint: &str) -> DiagnosticCheck {
    const NAME: &str = "tcp";

    let (host, port) = match host_and_port(endpoint) {
        Ok(target) => target,
        Err(e) => return DiagnosticCheck::fail(NAME, e, "Fix the configured KME endpoint"),
    };

    match TcpStream::connect((host.as_str(), port)).await {
        Ok(_) => DiagnosticCheck::pass(NAME, format!("{}:{} accepts connections", host, port)),
        Err(e) => DiagnosticCheck::fail(
            NAME,
            format!("cannot connect to {}:{}: {}", host, port, e),
            format!("Check that the KME listens on port {} and that firewalls allow it", port),
        ),
    }
}

async fn check_tls(config: TransportConfig) -> DiagnosticCheck {
    const NAME: &str = "tls";

    let transport = match HttpsTransport::new(config) {
        Ok(transport) => transport,
        Err(e) => {
            return DiagnosticCheck::fail(
                NAME,
                e.to_string(),
                "Fix the certificate, key and CA paths before testing TLS",
            )
        }
    };

    // Any HTTP status proves the handshake completed
    match transport.send(Method::Get, "/", &[], None).await {
        Ok(response) => DiagnosticCheck::pass(
            NAME,
            format!("handshake completed (HTTP {})", response.status),
        ),
        Err(e) => {
            let remediation = match &e {
                TransportError::TlsVerificationFailed(_) => {
                    "Check that the CA bundle signed the KME certificate and that the endpoint host matches it"
                }
                TransportError::Timeout(_) => "KME did not answer in time; check load and network latency",
                TransportError::Dns(_) => "Check DNS configuration for the KME host",
                TransportError::ConnectionRefused(_) => "Check that the KME is running and reachable",
                TransportError::Configuration(_) => "Fix the credential files",
            };
            DiagnosticCheck::fail(NAME, e.to_string(), remediation)
        }
    }
}
