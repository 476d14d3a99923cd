//! Lineforge sync server binary.
//!
//! Configuration comes from the environment (`LINEFORGE_BIND`, `HOST`/`PORT`,
//! `LINEFORGE_STORAGE_PATH`, `LINEFORGE_IDLE_TIMEOUT_SECS`,
//! `LINEFORGE_MAX_FRAME_BYTES`); `RUST_LOG` controls log output.

use lineforge_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => log::info!("Persisting snapshot to {}", path.display()),
        None => log::warn!("No LINEFORGE_STORAGE_PATH set, snapshot is in-memory only"),
    }

    let server = match CollabServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            log::info!(
                "Shutting down ({} connections served, {} active)",
                stats.total_connections,
                stats.active_connections
            );
        }
    }
}
