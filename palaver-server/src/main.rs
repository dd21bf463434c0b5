use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use palaver_server::config::ServerConfig;
use palaver_server::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (PALAVER_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("PALAVER_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("palaver_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::parse();
    tracing::info!(
        server = %config.server_id,
        peers = config.peers.len(),
        data_dir = %config.data_dir.display(),
        "starting replica"
    );
    Server::new(config).run().await
}
