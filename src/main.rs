// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Demo chat server: one `RoomChannel` with a `send_message` action, served
//! on `/cable`.  Pass `--nats-url` to federate broadcasts across nodes.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use strand::{AuthResult, Cable, CableConfig, ChannelDescription, NatsRelay};

#[derive(Parser)]
#[command(name = "strand", version, about = "Action Cable v1 demo chat server.")]
struct Cli {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "STRAND_HOST")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 28080, env = "STRAND_PORT")]
    port: u16,

    /// Allowed origin hosts (repeatable). Empty permits every origin.
    #[arg(long = "allowed-origin", env = "STRAND_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// NATS server URL (e.g. "nats://nats:4222"). When set, broadcasts are
    /// relayed across every node sharing the bus.
    #[arg(long, env = "STRAND_NATS_URL")]
    nats_url: Option<String>,

    /// Auth token for the NATS connection.
    #[arg(long, env = "STRAND_NATS_TOKEN")]
    nats_token: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = CableConfig::default()
        .with_allowed_origins(cli.allowed_origins)
        .with_authenticator(authenticate);

    if let Some(url) = cli.nats_url {
        let relay = NatsRelay::connect(&url, cli.nats_token.as_deref()).await?;
        config = config.with_broker(Arc::new(relay));
    }

    let cable = Cable::new(config).await?;
    cable.register_channel(room_channel());

    let router = Router::new().route("/cable", get(cable_route)).with_state(Arc::clone(&cable));

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("strand listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    cable.stop().await;
    Ok(())
}

async fn cable_route(
    State(cable): State<Arc<Cable>>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    cable.handle(ws, &headers, &uri).await
}

/// Identify the client by the `user` query parameter; anonymous otherwise.
fn authenticate(_headers: &HeaderMap, uri: &Uri) -> AuthResult {
    let user = uri.query().and_then(|query| {
        query.split('&').find_map(|pair| pair.strip_prefix("user=").map(str::to_owned))
    });
    AuthResult::Accept(user.map(Value::String))
}

fn room_channel() -> ChannelDescription {
    ChannelDescription::new("RoomChannel")
        .on_subscribed(|ch| async move {
            let room = room_stream(ch.params());
            ch.stream_from(&room).await;
        })
        .on_perform_action(|ch, data| async move {
            #[derive(Deserialize)]
            struct Action {
                #[serde(default)]
                action: String,
                #[serde(default)]
                message: String,
            }
            let Ok(action) = serde_json::from_str::<Action>(&data) else { return };
            if action.action == "send_message" {
                let sent_by = ch
                    .connection_identity()
                    .cloned()
                    .unwrap_or(Value::String("anonymous".to_owned()));
                let payload = json!({"sendBy": sent_by, "message": action.message});
                if let Err(e) = ch.broadcast(&room_stream(ch.params()), &payload).await {
                    error!(err = %e, "room broadcast failed");
                }
            }
        })
}

fn room_stream(params: &Value) -> String {
    format!("room_{}", params.get("id").and_then(Value::as_u64).unwrap_or(0))
}
