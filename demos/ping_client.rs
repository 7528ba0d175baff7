//! Ping Client - sends typed pings to an echo service and times the replies.
//!
//! ```text
//! cargo run --example ping_client -- 127.0.0.1:7070 10
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use peerwire::{Client, ClientConfig, Message, SessionHandle, SessionObserver};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Ping {
    seq: u32,
    note: String,
}

struct Replies(mpsc::UnboundedSender<Message>);

impl SessionObserver for Replies {
    fn message_received(&self, _session: &SessionHandle, message: Message) {
        let _ = self.0.send(message);
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

    let mut args = std::env::args().skip(1);
    let addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7070".to_string())
        .parse()?;
    let count: u32 = args.next().map(|n| n.parse::<u32>()).transpose()?.unwrap_or(5);

    let (tx, mut replies) = mpsc::unbounded_channel();
    let mut client = Client::new(ClientConfig::new(addr.into()), Arc::new(Replies(tx)));
    client.connect()?;
    client.wait_connected().await?;

    for seq in 0..count {
        let ping = Ping {
            seq,
            note: "ping".to_string(),
        };
        let started = Instant::now();
        client
            .send_message(&Message::from_serializable(&ping, &"ping/v1")?)
            .await?;

        let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await?
            .ok_or("session ended")?;
        let pong: Ping = reply.decode_payload()?;
        info!(seq = pong.seq, rtt = ?started.elapsed(), "pong");
    }

    client.disconnect().await;
    Ok(())
}
