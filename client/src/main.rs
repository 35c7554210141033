use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hearth_client::auth::Session;
use hearth_client::config::{ClientConfig, DEFAULT_CONFIG_PATH};
use hearth_client::engine::events::ClientEvent;
use hearth_client::Client;

/// Connect to the realtime service and log every notification.
#[derive(Debug, Parser)]
#[command(name = "hearth", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Bot token, or a user session object as JSON.
    #[arg(long, env = "HEARTH_TOKEN", hide_env_values = true)]
    token: String,

    /// Override the realtime endpoint.
    #[arg(long)]
    ws_url: Option<String>,
}

fn parse_session(token: &str) -> Result<Session> {
    if token.trim_start().starts_with('{') {
        serde_json::from_str(token).context("session JSON is not a valid session object")
    } else {
        Ok(Session::Bot(token.to_string()))
    }
}

fn log_event(client: &Client, event: &ClientEvent) {
    match event {
        ClientEvent::Heartbeat { latency } => {
            debug!(latency_ms = latency.as_millis() as u64, "heartbeat")
        }
        ClientEvent::Error(payload) => warn!(?payload, "connection error"),
        ClientEvent::Ready => {
            let store = client.store();
            let store = store.read();
            info!(
                user = store.current_user().map(|u| u.name()).unwrap_or("?"),
                servers = store.servers.len(),
                channels = store.channels.len(),
                users = store.users.len(),
                "ready"
            );
        }
        ClientEvent::MessageCreate(message) => info!(
            channel_id = %message.channel_id,
            author_id = %message.author_id,
            "message"
        ),
        other => info!(event = other.name()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(&args.config)?;
    let mut options = config.to_options();
    if let Some(url) = args.ws_url {
        options.ws_url = url;
    }
    let session = parse_session(&args.token)?;

    let mut client = Client::new(options);
    let mut events = client.subscribe();
    client.connect(session).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(ClientEvent::Logout) => {
                    warn!("session was revoked");
                    break;
                }
                Ok(event) => log_event(&client, &event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notifications dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}
