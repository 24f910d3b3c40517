//! # Chat Relay Server
//!
//! Clients post messages over `/submit`, which are validated and published to
//! a Pub/Sub topic. A single subscription on that topic feeds the broadcast
//! engine, which fans every message out to the sockets connected on
//! `/receive`. Several instances can share one Redis and behave as one room.
//!
//! Losing the upstream subscription is fatal: the process exits with an error
//! so a supervisor can restart it.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use lib_chat::validation::InboundValidator;
use lib_chat::{BroadcastEngine, ClientRegistry, MemoryBus, MessageBus, RedisBus};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod chat_logic;
use chat_logic::{config, downstream, logger, state, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (settings, notices) = config::load_config();
    let log_path = logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Logging to {}", log_path.display());
    for notice in &notices {
        notice.emit();
    }
    log::info!("Starting chat relay on port {} (topic '{}')", settings.port, settings.topic);

    let bus: Arc<dyn MessageBus> = match &settings.redis_url {
        Some(url) => Arc::new(RedisBus::connect(url).await?),
        None => {
            log::warn!("REDIS_URL is not set; using the in-process bus. Messages stay on this instance.");
            Arc::new(MemoryBus::new())
        }
    };

    let registry = Arc::new(ClientRegistry::new());
    let engine = Arc::new(BroadcastEngine::new(registry.clone(), settings.topic.clone()));
    let stats = engine.stats();
    let shutdown = CancellationToken::new();

    let app_state = state::AppState::new(
        registry,
        InboundValidator::new(bus.clone(), settings.topic.clone()),
        settings.route_limits(),
        settings.delivery_options(),
    );

    let mut upstream_handle = tokio::spawn(upstream::run(engine, bus, shutdown.clone()));
    let mut downstream_handle = tokio::spawn(downstream::run(settings, app_state, shutdown.clone()));

    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {}
        res = &mut upstream_handle => {
            failure = Some(match res {
                Ok(Ok(())) => anyhow!("broadcast engine stopped unexpectedly"),
                Ok(Err(e)) => anyhow!(e).context("broadcast engine failed"),
                Err(e) => anyhow!(e).context("broadcast engine task panicked"),
            });
        }
        res = &mut downstream_handle => {
            failure = Some(match res {
                Ok(Ok(())) => anyhow!("downstream server stopped unexpectedly"),
                Ok(Err(e)) => e.context("downstream server failed"),
                Err(e) => anyhow!(e).context("downstream server task panicked"),
            });
        }
    }

    // Send shutdown signal to all components
    shutdown.cancel();

    if !upstream_handle.is_finished() {
        let _ = upstream_handle.await;
    }
    if !downstream_handle.is_finished() {
        let _ = downstream_handle.await;
    }

    let totals = stats.snapshot();
    log::info!(
        "Relayed {} message(s): {} hand-offs, {} skipped, {} slow client(s) evicted",
        totals.received,
        totals.handed_off,
        totals.skipped,
        totals.evicted
    );

    match failure {
        Some(e) => {
            log::error!("{:#}", e);
            Err(e)
        }
        None => {
            log::info!("Shutdown complete.");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Ctrl-C received, initiating shutdown.");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
