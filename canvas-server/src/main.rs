//! Standalone collaboration server.
//!
//! Starts the hub coordinator, accepts WebSocket connections at
//! `ws://<host>:<port>/?user_id=..&design_id=..` and runs until Ctrl-C.

use canvas_collab::hub::{DEFAULT_CLIENT_QUEUE_CAPACITY, DEFAULT_COMMAND_CAPACITY};
use canvas_collab::server::DEFAULT_MAX_MESSAGE_BYTES;
use canvas_collab::{CollabServer, Hub, HubConfig, HubHandle, ServerConfig};
use clap::Parser;
use env_logger::Env;
use std::error::Error;

/// Real-time collaboration hub for the canvas designer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "COLLAB_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Outbound messages buffered per client before it is evicted
    #[arg(long, env = "COLLAB_QUEUE_CAPACITY", default_value_t = DEFAULT_CLIENT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Largest inbound message in bytes
    #[arg(long, env = "COLLAB_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Bound of the hub's command queue
    #[arg(long, env = "COLLAB_HUB_CAPACITY", default_value_t = DEFAULT_COMMAND_CAPACITY)]
    hub_capacity: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            client_queue_capacity: self.queue_capacity,
            max_message_bytes: self.max_message_bytes,
            hub: HubConfig {
                command_capacity: self.hub_capacity.max(1),
            },
            ..ServerConfig::default()
        }
    }
}

/// Resolves on Ctrl-C after stopping the hub, which hangs up every client.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    if let Err(e) = hub.shutdown().await {
        log::debug!("Hub already stopped: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // A missing .env file is fine.
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config();

    let (hub, handle) = Hub::new(config.hub.clone());
    let hub_task = hub.start();

    let server = CollabServer::new(config, handle);
    log::info!(
        "Client queue capacity {}, max message {} bytes",
        server.config().client_queue_capacity,
        server.config().max_message_bytes
    );
    // Returns once the hub is stopped and open connections have flushed
    // their close frames (or the grace period ran out).
    let served = server.run(shutdown_signal(server.hub().clone())).await;

    // The hub also stops here if serving failed before Ctrl-C.
    if let Err(e) = server.hub().shutdown().await {
        log::debug!("Hub already stopped: {e}");
    }
    let stats = hub_task.await?;
    log::info!(
        "Hub stopped: {} messages broadcast, {} deliveries, {} evictions",
        stats.messages_broadcast,
        stats.deliveries,
        stats.evictions
    );

    served?;
    Ok(())
}
