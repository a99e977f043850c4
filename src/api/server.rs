//! Axum server assembly: CORS, tracing, bearer auth, and the TCP listener.
//!
//! Follows `commands::api::server::start_server`'s shape (build CORS +
//! trace layers, nest routers under a state, bind a `TcpListener`, call
//! `axum::serve`), narrowed to a single unnested router since this control
//! plane has no dashboard or auth-proxy surface to mount alongside it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware as axum_middleware};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info};

use crate::api::middleware::bearer_auth;
use crate::api::routes::{self, AppState};
use crate::collaborators::TokenVerifier;

/// Builds the full router: public `/health`, everything else behind bearer
/// auth, wrapped in CORS and request tracing.
pub fn build_router(state: AppState, token_verifier: Arc<dyn TokenVerifier>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    let protected = routes::protected_routes(state.clone()).route_layer(
        axum_middleware::from_fn_with_state(token_verifier, bearer_auth),
    );

    Router::new()
        .merge(routes::health_route(state))
        .merge(protected)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
}

pub async fn serve(router: Router, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!(%addr, "traffic-core listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
