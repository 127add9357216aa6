//! chatwatch
//!
//! Watches a directory of bot conversation logs and mirrors it live to
//! WebSocket observers.

mod broadcaster;
mod config;
mod debounce;
mod decoder;
mod logging;
mod resolver;
mod store;
mod watcher;
mod websocket;

use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, http::HeaderValue, response::IntoResponse, routing::get, Json, Router};
use chatwatch_protocol::Snapshot;
use clap::Parser;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::{Cli, Command, Config};
use crate::watcher::Pipeline;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.validate()?;
    let logging = logging::init_logging()?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        version = env!("CARGO_PKG_VERSION"),
        conversations_dir = %config.conversations_dir.display(),
        "Starting chatwatch"
    );

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_server(config).await,
        Command::Dump => dump(config).await,
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let broadcaster = Arc::new(Broadcaster::new(config.relay_capacity));

    // Store is populated before the listener opens, so no observer sees an empty boot snapshot.
    let watcher = watcher::start(config.watcher_settings(), broadcaster.clone()).await?;

    let app = router(broadcaster, config.cors_origin_header()?);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %listener.local_addr()?,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher.stop().await;
    info!(
        component = "server",
        event = "server.stopped",
        "chatwatch stopped"
    );
    Ok(())
}

/// Offline counterpart of `/api/conversations`.
async fn dump(config: Config) -> anyhow::Result<()> {
    let snapshot = load_snapshot(&config).await?;
    let json = serde_json::to_string_pretty(&snapshot)?;
    println!("{json}");
    Ok(())
}

/// Decode the conversations directory once, without watching it.
async fn load_snapshot(config: &Config) -> anyhow::Result<Snapshot> {
    let root = watcher::canonical_root(&config.conversations_dir)?;
    let broadcaster = Arc::new(Broadcaster::new(config.relay_capacity));
    let (mut pipeline, _settled_rx) = Pipeline::new(
        root,
        config.log_suffix.clone(),
        config.debounce(),
        broadcaster,
    );
    pipeline.boot().await;
    Ok(pipeline.snapshot())
}

fn router(broadcaster: Arc<Broadcaster>, cors_origin: Option<HeaderValue>) -> Router {
    let allow_origin = match cors_origin {
        Some(origin) => AllowOrigin::exact(origin),
        None => AllowOrigin::from(Any),
    };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/conversations", get(conversations_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(allow_origin)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(broadcaster)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn conversations_handler(State(broadcaster): State<Arc<Broadcaster>>) -> impl IntoResponse {
    Json(broadcaster.snapshot())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(
                component = "server",
                event = "server.signal_install_failed",
                signal = "ctrl_c",
                error = %err,
                "Failed to listen for ctrl-c"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(
                    component = "server",
                    event = "server.signal_install_failed",
                    signal = "sigterm",
                    error = %err,
                    "Failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(
        component = "server",
        event = "server.shutdown_signal",
        "Shutdown signal received"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConversationStore;
    use chatwatch_protocol::{Message, Sender};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(app: Router, path: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");

        server.abort();
        response
    }

    #[tokio::test]
    async fn dump_decodes_conversations_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bot_dir = dir.path().join("botA");
        std::fs::create_dir_all(&bot_dir).expect("bot dir");
        std::fs::write(bot_dir.join("alice.log"), "[2024-01-01 10:00:05] alice: hi\n")
            .expect("write log");

        let cli = Cli::try_parse_from([
            "chatwatch",
            "dump",
            "--conversations-dir",
            dir.path().to_str().expect("utf-8 path"),
        ])
        .expect("valid arguments");
        let config = cli.config.validate().expect("valid config");
        let snapshot = load_snapshot(&config).await.expect("snapshot");

        assert_eq!(snapshot.bot_count(), 1);
        let messages = snapshot.messages("botA", "alice").expect("alice");
        assert_eq!(messages[0].content, "hi");
    }

    #[tokio::test]
    async fn dump_fails_for_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing");
        let cli = Cli::try_parse_from([
            "chatwatch",
            "--conversations-dir",
            missing.to_str().expect("utf-8 path"),
        ])
        .expect("valid arguments");

        assert!(load_snapshot(&cli.config).await.is_err());
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let broadcaster = Arc::new(Broadcaster::new(8));
        let response = get(router(broadcaster, None), "/health").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#"{"status":"ok"}"#));
    }

    #[tokio::test]
    async fn conversations_endpoint_serves_current_snapshot() {
        let broadcaster = Arc::new(Broadcaster::new(8));
        let mut store = ConversationStore::new();
        let event = store
            .apply_file_updated(
                "botA",
                "alice",
                vec![Message {
                    timestamp: "2024-01-01 10:00:05".to_string(),
                    parsed_at: None,
                    sender: Sender::User,
                    content: "hi".to_string(),
                    is_entry: false,
                }],
            )
            .expect("change");
        broadcaster.relay(store.snapshot(), event);

        let response = get(router(broadcaster, None), "/api/conversations").await;
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .expect("response body");
        let snapshot: serde_json::Value = serde_json::from_str(body).expect("json body");

        assert_eq!(snapshot["revision"], 1);
        assert_eq!(
            snapshot["conversations"]["botA"]["alice"][0]["content"],
            "hi"
        );
    }
}
