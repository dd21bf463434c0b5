//! Server configuration: everything the core consumes from outside.
//!
//! Every flag can also come from a `PALAVER_*` environment variable, so
//! a fleet can share one binary invocation and differ only in env.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::proto::ServerId;

#[derive(Parser, Debug, Clone)]
#[command(name = "palaver-server", about = "Replicated group-chat server")]
pub struct ServerConfig {
    /// This replica's server id.
    #[arg(long, env = "PALAVER_SERVER_ID")]
    pub server_id: ServerId,

    /// Peer replica as `id=host:port`; repeat once per peer.
    #[arg(
        long = "peer",
        value_name = "ID=ADDR",
        value_parser = parse_peer,
        env = "PALAVER_PEERS",
        value_delimiter = ','
    )]
    pub peers: Vec<(ServerId, String)>,

    /// Address to accept client and peer connections on.
    #[arg(long, default_value = "127.0.0.1:7400", env = "PALAVER_LISTEN_ADDR")]
    pub listen_addr: String,

    /// Durable log directory.
    #[arg(long, default_value = "./palaver-data", env = "PALAVER_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Seconds between liveness handshake sweeps.
    #[arg(long, default_value_t = 5, env = "PALAVER_HANDSHAKE_INTERVAL_SECS")]
    pub handshake_interval_secs: u64,

    /// Timeout for one peer exchange, in milliseconds.
    #[arg(long, default_value_t = 2000, env = "PALAVER_SEND_TIMEOUT_MS")]
    pub send_timeout_ms: u64,

    /// Delivery retry backoff, in milliseconds.
    #[arg(long, default_value_t = 1000, env = "PALAVER_RETRY_INTERVAL_MS")]
    pub retry_interval_ms: u64,

    /// Consecutive handshake failures before a peer counts as down.
    #[arg(long, default_value_t = 3, env = "PALAVER_FAILURE_THRESHOLD")]
    pub failure_threshold: u32,

    /// Seconds between WAL compaction sweeps.
    #[arg(long, default_value_t = 30, env = "PALAVER_GC_INTERVAL_SECS")]
    pub gc_interval_secs: u64,
}

impl ServerConfig {
    /// Reject configurations the rest of the stack cannot make sense of.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.is_empty() {
            return Err(ConfigError::MissingServerId);
        }
        let mut seen = std::collections::HashSet::new();
        for (id, _) in &self.peers {
            if *id == self.server_id {
                return Err(ConfigError::SelfPeer(id.clone()));
            }
            if !seen.insert(id) {
                return Err(ConfigError::DuplicatePeer(id.clone()));
            }
        }
        Ok(())
    }

    pub fn peer_ids(&self) -> Vec<ServerId> {
        self.peers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn peer_addrs(&self) -> HashMap<ServerId, String> {
        self.peers.iter().cloned().collect()
    }

    pub fn handshake_interval(&self) -> Duration {
        Duration::from_secs(self.handshake_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

fn parse_peer(raw: &str) -> Result<(ServerId, String), String> {
    let Some((id, addr)) = raw.split_once('=') else {
        return Err(format!("expected id=addr, got {raw:?}"));
    };
    let (id, addr) = (id.trim(), addr.trim());
    if id.is_empty() || addr.is_empty() {
        return Err(format!("expected id=addr, got {raw:?}"));
    }
    Ok((id.to_string(), addr.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server id must not be empty")]
    MissingServerId,
    #[error("peer {0} has the same id as this server")]
    SelfPeer(ServerId),
    #[error("peer {0} is listed twice")]
    DuplicatePeer(ServerId),
}
