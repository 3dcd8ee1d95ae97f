use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use filemesh::cli::Cli;
use filemesh::config::Config;
use filemesh::logging;
use filemesh::{crypto, FileServer, FileServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;
    logging::init_logging_safe(&config.logging.level);

    let encryption_key = match cli.encryption_key()? {
        Some(key) => key,
        None => {
            let key = crypto::new_encryption_key();
            info!(
                key = %hex::encode(key),
                "generated a cluster encryption key; start the other nodes with --key"
            );
            key
        }
    };

    let listen_addr = cli.listen.unwrap_or(config.network.listen_addr);
    let bootstrap_nodes = if cli.bootstrap.is_empty() {
        config.network.bootstrap_nodes
    } else {
        cli.bootstrap
    };
    let storage_root = cli.root.unwrap_or(config.storage.root);

    let server = FileServer::new(FileServerConfig {
        id: None,
        encryption_key,
        storage_root,
        listen_addr,
        bootstrap_nodes,
        handshake: None,
    });

    let mut runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        res = &mut runner => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.stop();
            runner.await??;
        }
    }
    Ok(())
}
