//! Command line interface
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


use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "qkd-node")]
#[command(about = "ETSI GS QKD 014 key supply client", long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides QKD_LOG_LEVEL
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Emit JSON logs instead of console output
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Query the KME status for the configured pairing
    Status,

    /// Obtain N fresh keys from the KME (master only)
    Keys {
        /// Number of keys to obtain
        count: usize,
    },

    /// Poll pairing health until interrupted
    Monitor {
        /// Seconds between polls; defaults to QKD_POLL_INTERVAL_SECS
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Run connectivity diagnostics against the KME
    Diagnostic,

    /// Retrieve keys announced by the master SAE (slave only)
    Import {
        /// key_IDs received from the partner
        #[arg(required = true)]
        key_ids: Vec<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
