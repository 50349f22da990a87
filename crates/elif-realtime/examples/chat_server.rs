//! Minimal chat server
//!
//! ```text
//! cargo run -p elif-realtime --example chat_server
//! websocat ws://127.0.0.1:8080/ws
//! {"type":"join_room","data":{"room":"lobby"}}
//! {"type":"broadcast","data":{"room":"lobby","type":"chat","payload":"hi"}}
//! ```

use elif_realtime::{
    init_logging, Client, Hub, HubConfig, LoggingConfig, Message, RealtimeResult, Server,
    ServerConfig,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LoggingConfig::development().with_service("chat-server"))?;

    let hub = Hub::new(HubConfig::from_env()?);

    // Say hello to the room whenever someone speaks for the first time.
    hub.register_handler("hello", |client: Arc<Client>, message: Message| async move {
        let name = message.data_value()?;
        client.set_metadata("name", name.clone());
        client
            .hub()
            .broadcast_to_room("lobby", &Message::with_payload("joined", json!({ "name": name })))
    });

    hub.start();

    let server = Server::new(hub.clone(), ServerConfig::from_env()?);
    let shutdown_hub = hub.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            shutdown_hub.shutdown().await;
        }
    });

    let result: RealtimeResult<()> = server.run().await;
    hub.shutdown().await;
    info!("Final stats: {:?}", hub.stats());
    result?;
    Ok(())
}
