//! CLI/env configuration (§8.2 of the design notes). Every value that §9's
//! open questions flagged as "should be an explicit config parameter, not
//! hardcoded" — chiefly the cache-prune interval — lands here rather than
//! as a literal buried in a channel.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(name = "broker", about = "Zero-trust connection-and-authorization broker")]
pub struct Args {
    /// Address the websocket listeners bind to.
    #[arg(long, env = "BROKER_BIND_ADDR", default_value = "0.0.0.0:8089")]
    pub bind_addr: SocketAddr,

    #[arg(long, env = "BROKER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Human)]
    pub log_format: LogFormat,

    /// How often a Gateway Channel walks its authorization cache dropping
    /// expired entries.
    #[arg(long, env = "BROKER_PRUNE_INTERVAL", default_value = "45s", value_parser = humantime_duration)]
    pub prune_interval: Duration,

    /// Coalescing window for relay presence churn before a
    /// `relays_presence` push is computed.
    #[arg(long, env = "BROKER_RELAY_DEBOUNCE", default_value = "50ms", value_parser = humantime_duration)]
    pub relay_debounce: Duration,

    /// Target number of relays selected per Gateway.
    #[arg(long, env = "BROKER_RELAY_SELECTION_COUNT", default_value_t = relay_selector::DEFAULT_COUNT)]
    pub relay_selection_count: usize,

    /// Deadline a pending `request_connection`/`authorize_flow` reference
    /// waits for the Gateway's reply before the Client Channel surfaces
    /// `offline`.
    #[arg(long, env = "BROKER_REQUEST_TIMEOUT", default_value = "30s", value_parser = humantime_duration)]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Human,
    Json,
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}
