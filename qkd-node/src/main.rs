//! QKD Node
//!
//! Command line front end for one SAE pairing: status queries, key requests,
//! key imports, continuous health monitoring and connectivity diagnostics.
//! Configuration comes from `.env` and `QKD_*` environment variables.
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


mod cli;

use anyhow::{bail, Context, Result};
use cli::{Cli, Command};
use qkd_client::{EtsiClient, HttpsTransport, KmeClient, TransportConfig};
use qkd_config::NodeConfig;
use qkd_keypool::{
    BufferLimits, DiagnosticSuite, HealthMonitor, KeyBufferManager, MonitorConfig, PoolConfig,
    TracingAlertSink,
};
use qkd_logging::{init_console_logging, init_logging};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Load configuration
    let config = NodeConfig::from_env().context("Failed to load configuration")?;

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    if cli.json_logs {
        init_logging(&config.sae_id, level);
    } else {
        init_console_logging(&config.sae_id, level);
    }

    info!(
        sae_id = %config.sae_id,
        partner = %config.partner_sae_id,
        role = %config.role,
        endpoint = %config.endpoint,
        "Configuration loaded"
    );

    match cli.command {
        Command::Status => status(&config).await,
        Command::Keys { count } => keys(&config, count).await,
        Command::Monitor { interval } => monitor(&config, interval).await,
        Command::Diagnostic => diagnostic(&config).await,
        Command::Import { key_ids } => import(&config, key_ids).await,
    }
}

fn connect(config: &NodeConfig) -> Result<Arc<dyn KmeClient>> {
    let identity = config.identity()?;
    let transport = HttpsTransport::new(TransportConfig::new(
        &identity,
        config.connect_timeout(),
        config.request_timeout(),
    ))
    .context("Failed to set up the mTLS transport")?;

    Ok(Arc::new(EtsiClient::new(transport, identity)))
}

async fn status(config: &NodeConfig) -> Result<()> {
    let client = connect(config)?;
    let snapshot = client
        .get_status()
        .await
        .context("Status request failed")?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn keys(config: &NodeConfig, count: usize) -> Result<()> {
    if count == 0 {
        bail!("key count must be at least 1");
    }

    let client = connect(config)?;
    if !client.identity().is_master() {
        bail!("keys is only available to master SAEs; slaves use import");
    }

    let mut pool = PoolConfig::from_node_config(config)?;
    pool.auto_refill = false;
    pool.limits = BufferLimits::new(count, count.max(config.max_keys), config.key_ttl())?;

    let manager = KeyBufferManager::start(client, pool)?;
    let result = obtain_keys(&manager, count).await;
    manager.shutdown(SHUTDOWN_TIMEOUT).await;
    result
}

async fn obtain_keys(manager: &KeyBufferManager, count: usize) -> Result<()> {
    let added = manager.refill_now().await.context("Key request failed")?;
    info!(requested = count, added = added, "Keys received");
    print_keys(manager, added, "cli-keys").await
}

async fn import(config: &NodeConfig, key_ids: Vec<String>) -> Result<()> {
    let client = connect(config)?;
    if client.identity().is_master() {
        bail!("import is only available to slave SAEs; masters use keys");
    }

    let mut pool = PoolConfig::from_node_config(config)?;
    pool.limits = BufferLimits::new(0, key_ids.len().max(config.max_keys), config.key_ttl())?;

    let manager = KeyBufferManager::start(client, pool)?;
    let result = match manager.import_external_keys(&key_ids).await {
        Ok(added) => print_keys(&manager, added, "cli-import").await,
        Err(e) => Err(e).context("Key import failed"),
    };
    manager.shutdown(SHUTDOWN_TIMEOUT).await;
    result
}

/// Key IDs and sizes only; raw key material never leaves the process
async fn print_keys(manager: &KeyBufferManager, count: usize, purpose: &str) -> Result<()> {
    for _ in 0..count {
        let key = manager.consume(purpose).await?;
        println!("{}\t{} bits", key.key_id(), key.size_bits());
    }
    Ok(())
}

async fn monitor(config: &NodeConfig, interval: Option<u64>) -> Result<()> {
    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.poll_interval());
    if interval.is_zero() {
        bail!("monitor interval must be at least 1 second");
    }

    let client = connect(config)?;
    let suite = Arc::new(DiagnosticSuite::new(
        TransportConfig::from_node_config(config),
        config.diagnostic_timeout(),
    ));
    let monitor = Arc::new(
        HealthMonitor::new(
            client,
            MonitorConfig::from_config(config),
            Arc::new(TracingAlertSink),
        )
        .with_diagnostics(suite),
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut handle = monitor.clone().spawn(interval, shutdown_rx);

    // Wait for shutdown signal
    info!("Health monitor running. Press Ctrl+C to stop.");
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
        }
    }

    let _ = shutdown.send(true);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
        warn!("Health monitor did not stop in time, aborting");
        handle.abort();
    }

    let record = monitor.record();
    info!(
        total_checks = record.total_checks,
        failed_checks = record.failed_checks(),
        uptime = record.uptime_ratio(),
        "Health monitor stopped"
    );
    Ok(())
}

async fn diagnostic(config: &NodeConfig) -> Result<()> {
    let suite = DiagnosticSuite::new(
        TransportConfig::from_node_config(config),
        config.diagnostic_timeout(),
    );
    let report = suite.run().await;
    report.log_summary();

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.passed() {
        bail!("{} diagnostic check(s) failed", report.failures().count());
    }
    Ok(())
}
