//! CherryRecorder Server binary
//!
//! Wires configuration, the history store, the chat registry and every
//! listener onto one shared runtime, then waits for SIGINT/SIGTERM and
//! shuts the pieces down in order: listeners first, then sessions.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cherryrecorder_server::chat::{listener, RegistryHandle};
use cherryrecorder_server::{config::ServerConfig, echo, history::MessageHistory, http, tls};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cherryrecorder_server=info,tower_http=info".into()),
        )
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = config.worker_threads {
        builder.worker_threads(threads);
    }
    let runtime = builder.build().context("failed to build runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!("===========================================");
    info!("CherryRecorder Server v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");

    if config.maps_api_key.is_empty() {
        warn!("GOOGLE_MAPS_API_KEY environment variable not set!");
        warn!("Places API features will not work.");
    } else {
        info!("Google Maps API key loaded successfully");
    }

    let shutdown = CancellationToken::new();
    let history = Arc::new(MessageHistory::new(&config.history_dir));
    let registry = RegistryHandle::new(history);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let any_ip: IpAddr = "0.0.0.0".parse()?;

    // Echo service
    let echo_listener = TcpListener::bind(SocketAddr::new(any_ip, config.echo_port))
        .await
        .context("failed to bind echo port")?;
    tasks.push(tokio::spawn(echo::run_echo_server(
        echo_listener,
        shutdown.clone(),
    )));

    // Chat: line TCP and WebSocket
    let chat_tcp = TcpListener::bind(SocketAddr::new(any_ip, config.chat_tcp_port))
        .await
        .context("failed to bind chat TCP port")?;
    tasks.push(tokio::spawn(listener::run_chat_tcp_listener(
        chat_tcp,
        registry.clone(),
        shutdown.clone(),
    )));

    let chat_ws = TcpListener::bind(SocketAddr::new(any_ip, config.chat_ws_port))
        .await
        .context("failed to bind chat WebSocket port")?;
    tasks.push(tokio::spawn(listener::run_chat_ws_listener(
        chat_ws,
        registry.clone(),
        shutdown.clone(),
    )));

    // TLS-backed listeners
    let tls_config = if config.tls_configured() {
        Some(tls::load_tls_config(&config.cert_path, &config.key_path)?)
    } else {
        warn!("SSL certificate not provided, HTTPS/WSS servers disabled");
        None
    };

    if let Some(tls_config) = &tls_config {
        let chat_wss = TcpListener::bind(SocketAddr::new(any_ip, config.chat_wss_port))
            .await
            .context("failed to bind chat WSS port")?;
        tasks.push(tokio::spawn(listener::run_chat_wss_listener(
            chat_wss,
            TlsAcceptor::from(tls_config.clone()),
            registry.clone(),
            shutdown.clone(),
        )));
    }

    // HTTP/HTTPS front
    let state = Arc::new(http::AppState::new(&config)?);

    let http_listener = TcpListener::bind(SocketAddr::new(config.http_bind_ip, config.http_port))
        .await
        .context("failed to bind HTTP port")?;
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::run_http_server(http_listener, state, shutdown).await {
                error!("HTTP server error: {}", e);
            }
        }));
    }

    if let Some(tls_config) = tls_config {
        let https_listener =
            TcpListener::bind(SocketAddr::new(config.http_bind_ip, config.https_port))
                .await
                .context("failed to bind HTTPS port")?;
        tasks.push(tokio::spawn(http::run_https_server(
            https_listener,
            tls_config,
            state.clone(),
            shutdown.clone(),
        )));
    }

    info!("===========================================");
    info!("All servers started successfully!");
    info!("HTTP:      http://localhost:{}", config.http_port);
    if config.tls_configured() {
        info!("HTTPS:     https://localhost:{}", config.https_port);
        info!("WSS:       wss://localhost:{}", config.chat_wss_port);
    }
    info!("WebSocket: ws://localhost:{}", config.chat_ws_port);
    info!("Chat TCP:  tcp://localhost:{}", config.chat_tcp_port);
    info!("Echo:      tcp://localhost:{}", config.echo_port);
    info!("===========================================");
    info!("Press Ctrl+C to stop the server");

    wait_for_signal().await;
    info!("Stop signal received, shutting down...");

    // Listeners exit on the token, then sessions drain and close.
    shutdown.cancel();
    registry.shutdown().await;

    let drain = futures_util::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Shutdown grace period expired with tasks still running");
    }

    info!("Server stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
