//! Runtime configuration.
//!
//! Defaults describe a mainnet node; the binary overrides fields from
//! its command line. Timing fields are stored in the units the options
//! are named in, with `Duration` accessors for consumers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire;

/// DNS seeds for mainnet bootstrap, from Bitcoin Core's chain params.
pub const MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be:8333",
    "dnsseed.bluematt.me:8333",
    "seed.bitcoin.jonasschnelli.ch:8333",
    "seed.btc.petertodd.net:8333",
    "seed.bitcoin.sprovoost.nl:8333",
    "dnsseed.emzy.de:8333",
    "seed.bitcoin.wiz.biz:8333",
    "seed.mainnet.achownodes.xyz:8333",
];

#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker threads for the shared runtime (consumed by the binary
    /// when it builds the runtime).
    pub threads: usize,
    /// Network magic checked against every incoming heading.
    pub magic: u32,
    /// Listener port; 0 disables the inbound session.
    pub inbound_port: u16,
    /// Cap on concurrent inbound channels; 0 disables the session.
    pub inbound_connections: u32,
    /// Target count for the outbound session; 0 disables it.
    pub outbound_connections: u32,
    /// Retry cap for manual dials; 0 retries until stopped.
    pub manual_attempt_limit: u32,
    pub connect_timeout_seconds: u32,
    pub channel_handshake_seconds: u32,
    pub channel_heartbeat_minutes: u32,
    /// Stop a channel after this long without a completed message;
    /// 0 disables the watchdog.
    pub channel_inactivity_minutes: u32,
    /// Stop a channel outright after this lifetime; 0 disables.
    pub channel_expiration_minutes: u32,
    /// Backing file for the address book.
    pub hosts_file: PathBuf,
    /// Bootstrap DNS seeds, `host:port`.
    pub seeds: Vec<String>,
    /// Announce address for the version handshake.
    pub self_address: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            threads: 4,
            magic: wire::MAINNET_MAGIC,
            inbound_port: 8333,
            inbound_connections: 8,
            outbound_connections: 8,
            manual_attempt_limit: 0,
            connect_timeout_seconds: 5,
            channel_handshake_seconds: 30,
            channel_heartbeat_minutes: 5,
            channel_inactivity_minutes: 10,
            channel_expiration_minutes: 90,
            hosts_file: PathBuf::from("hosts.cache"),
            seeds: MAINNET_SEEDS.iter().map(|seed| seed.to_string()).collect(),
            self_address: None,
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_seconds))
    }

    pub fn channel_handshake(&self) -> Duration {
        Duration::from_secs(u64::from(self.channel_handshake_seconds))
    }

    pub fn channel_heartbeat(&self) -> Duration {
        Duration::from_secs(60 * u64::from(self.channel_heartbeat_minutes))
    }

    pub fn channel_inactivity(&self) -> Option<Duration> {
        match self.channel_inactivity_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(60 * u64::from(minutes))),
        }
    }

    pub fn channel_expiration(&self) -> Option<Duration> {
        match self.channel_expiration_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(60 * u64::from(minutes))),
        }
    }
}
