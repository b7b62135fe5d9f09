use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::api;
use crate::config::ServerConfig;
use crate::errors::ChatResult;
use crate::gateway::{ws, Gateway};
use crate::identity::{Directory, TokenVerifier};
use crate::logging;
use crate::plog_info;
use crate::presence::TypingTracker;
use crate::session::SessionManager;
use crate::store::MessageStore;

/// Everything the handlers need, constructed once per process. The session
/// manager and typing tracker are explicit instances passed by reference —
/// no global mutable state, and each is testable in isolation.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<MessageStore>,
    pub gateway: Arc<Gateway>,
    pub verifier: Arc<dyn TokenVerifier>,
}

pub fn build_state(
    config: ServerConfig,
    store: Arc<MessageStore>,
    verifier: Arc<dyn TokenVerifier>,
) -> AppState {
    let sessions = Arc::new(SessionManager::new());
    let typing = Arc::new(TypingTracker::new(config.typing_deadline));
    let gateway = Arc::new(Gateway::new(
        store.clone(),
        sessions,
        typing,
        config.store_retries,
    ));
    AppState {
        config: Arc::new(config),
        store,
        gateway,
        verifier,
    }
}

pub fn build_router(state: AppState) -> Router {
    api::router()
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Run the server until shutdown: HTTP + WebSocket listener plus the typing
/// sweep task that heals stale composing indicators.
pub async fn run(
    config: ServerConfig,
    directory: Arc<dyn Directory>,
    verifier: Arc<dyn TokenVerifier>,
) -> ChatResult<()> {
    let store = Arc::new(
        MessageStore::connect(&config.database_url, directory, config.max_body_chars).await?,
    );
    let bind_addr = config.bind_addr;
    let sweep_interval = config.sweep_interval;
    let state = build_state(config, store, verifier);

    let sweep_gateway = state.gateway.clone();
    let sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let expired = sweep_gateway.typing().sweep();
            if !expired.is_empty() {
                sweep_gateway.publish_typing_expiries(&expired);
            }
        }
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    plog_info!("listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep.abort();
    plog_info!("shut down");
    Ok(())
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    logging::log_response(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64() * 1000.0,
    );
    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
