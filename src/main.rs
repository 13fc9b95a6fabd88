use std::sync::Arc;

use chat_relay::{config, Server};
use log::error;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::from_env();
    let server = match Server::new(config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to start chat server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Chat server stopped: {}", e);
        std::process::exit(1);
    }
}
