//! quire-relay: single-room document sync relay.

use std::time::Duration;

use clap::Parser;
use quire_collab::{RelayServer, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "quire-relay", version, about = "Real-time document sync relay")]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "QUIRE_RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "QUIRE_RELAY_PORT", default_value_t = 1234)]
    port: u16,

    /// Seconds between heartbeat pings (0 disables)
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Frames buffered per peer before it is dropped
    #[arg(long, default_value_t = 256)]
    outbound_capacity: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            outbound_capacity: self.outbound_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = match RelayServer::bind(args.server_config()).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = server.serve() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!("Failed to listen for shutdown signal: {e}");
            }
            log::info!("Shutting down relay");
        }
    }
}
