use crate::chat_logic::config::Settings;
use crate::chat_logic::sink::WsClientSink;
use crate::chat_logic::state::AppState;
use anyhow::Context;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::StreamExt;
use lib_chat::attach;
use lib_chat::validation::SubmitError;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

const INDEX_HTML: &str = include_str!("index.html");

pub fn router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/submit", get(submit_handler))
        .route("/receive", get(receive_handler))
        .layer(cors)
        .with_state(app_state)
}

pub async fn run(settings: Settings, app_state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some((cert_path, key_path)) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .with_context(|| format!("Failed to load TLS configuration from {}", cert_path.display()))?;

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        log::info!("Downstream server listening on wss://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("Downstream TLS server failed")?;
    } else {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        serve(listener, app, shutdown).await.context("Downstream server failed")?;
    }
    Ok(())
}

/// Serves `app` on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    log::info!("Downstream server listening on ws://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
        })
        .await
}

async fn index_handler(ConnectInfo(addr): ConnectInfo<SocketAddr>, State(state): State<AppState>) -> Response {
    if !state.limits.index.check(addr.ip()) {
        return too_many_requests(addr, "/");
    }
    Html(INDEX_HTML).into_response()
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn submit_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if !state.limits.submit.check(addr.ip()) {
        return too_many_requests(addr, "/submit");
    }
    ws.on_upgrade(move |socket| handle_submit(socket, addr, state))
        .into_response()
}

async fn receive_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if !state.limits.receive.check(addr.ip()) {
        return too_many_requests(addr, "/receive");
    }
    ws.on_upgrade(move |socket| handle_receive(socket, addr, state))
        .into_response()
}

fn too_many_requests(addr: SocketAddr, route: &str) -> Response {
    log::warn!("Rate limit exceeded for {} on {}", addr, route);
    (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response()
}

async fn handle_submit(mut socket: WebSocket, addr: SocketAddr, state: AppState) {
    log::info!("Submitter {} connected", addr);

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match state.validator.submit(text.as_str()).await {
            Ok(_) => {}
            Err(SubmitError::Invalid(e)) => {
                log::warn!("Rejected message from {}: {}", addr, e);
                close_with(&mut socket, close_code::POLICY, "invalid message").await;
                break;
            }
            Err(SubmitError::Publish(e)) => {
                log::error!("Could not publish message from {}: {}", addr, e);
                close_with(&mut socket, close_code::ERROR, "publish failed").await;
                break;
            }
        }
    }

    log::info!("Submitter {} disconnected", addr);
}

async fn handle_receive(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let (write, mut read) = socket.split();
    let sink = WsClientSink::new(write);
    let closed = sink.closed_flag();
    let mut client = attach(state.registry.clone(), sink, state.delivery);
    log::info!("Receiver {} connected as client {}", addr, client.id);

    // Inbound frames on /receive carry nothing; reading only tracks the peer.
    let reader = async {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    let peer_left = tokio::select! {
        _ = reader => true,
        _ = &mut client.task => false,
    };
    if peer_left {
        closed.store(true, Ordering::Release);
        state.registry.deregister_entry(client.key);
        let _ = client.task.await;
    }

    log::info!("Receiver {} (client {}) disconnected", addr, client.id);
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        log::debug!("Failed to send close frame: {}", e);
    }
}
