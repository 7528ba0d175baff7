//! Echo Service - accepts clients and sends every message straight back.
//!
//! This example demonstrates:
//! - Starting an `EndpointService` from a JSON config
//! - Attaching a per-session observer in `client_connected`
//! - Replying from inside `message_received`
//! - Advertising the service under a name in a `LocalDirectory`
//!
//! # Running
//!
//! ```text
//! RUST_LOG=peerwire=debug cargo run --example echo_service -- 7070
//! cargo run --example ping_client -- 127.0.0.1:7070
//! ```

use std::sync::Arc;

use peerwire::discovery::LocalDirectory;
use peerwire::{
    EndpointService, Message, ServiceConfig, ServiceObserver, SessionHandle, SessionObserver,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Echo;

impl SessionObserver for Echo {
    fn session_started(&self, session: &SessionHandle) {
        info!(session = %session.id(), peer = ?session.peer_addr(), "client ready");
    }

    fn session_ended(&self, session: &SessionHandle) {
        info!(session = %session.id(), "client gone");
    }

    fn message_received(&self, session: &SessionHandle, message: Message) {
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.send_message(&message).await {
                info!(session = %session.id(), error = %e, "echo failed");
            }
        });
    }
}

impl ServiceObserver for Echo {
    fn service_advertised(&self, name: &str) {
        info!(name, "advertised");
    }

    fn client_connected(&self, session: &SessionHandle) {
        session.set_observer(Arc::new(Echo));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let port = std::env::args().nth(1).unwrap_or_else(|| "7070".to_string());
    let config = ServiceConfig::from_json_str(&format!(r#"{{ "port": {} }}"#, port))?;

    let config = config.with_advertisement("echo", "_peerwire._tcp");
    let mut service =
        EndpointService::new(config, Arc::new(Echo)).with_advertiser(Arc::new(LocalDirectory::new()));
    let addr = service.start().await?;
    info!(%addr, "echo service up, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    service.stop().await;
    Ok(())
}
