//! Server bootstrap: build a [`Node`] from configuration, spawn its
//! background tasks, and accept connections.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::net::{self, NetTransport};
use crate::node::Node;
use crate::storage::FsLog;

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Open storage, assemble the node, and recover durable state.
    fn build_state(&self) -> Result<Arc<Node>> {
        self.config.validate()?;
        let log = Arc::new(
            FsLog::open(&self.config.data_dir).map_err(|e| {
                anyhow::anyhow!("failed to open data dir {:?}: {e}", self.config.data_dir)
            })?,
        );
        let transport = Arc::new(NetTransport::new(
            self.config.peer_addrs(),
            self.config.send_timeout(),
            self.config.send_timeout(),
        ));
        let node = Node::open(
            &self.config.server_id,
            &self.config.peer_ids(),
            log,
            transport,
            self.config.failure_threshold,
        )?;
        node.recover()?;
        Ok(node)
    }

    fn spawn_background(&self, node: &Arc<Node>) {
        node.spawn_workers(self.config.retry_interval());
        node.spawn_liveness(self.config.handshake_interval());
        node.spawn_gc(self.config.gc_interval());
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let node = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!(
            server = %self.config.server_id,
            addr = %self.config.listen_addr,
            peers = self.config.peers.len(),
            "listening"
        );
        self.spawn_background(&node);
        net::serve(node, listener).await?;
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for
    /// testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let node = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!(server = %self.config.server_id, addr = %addr, "listening");
        self.spawn_background(&node);
        let handle = tokio::spawn(async move {
            net::serve(node, listener).await?;
            Ok(())
        });
        Ok((addr, handle))
    }
}
