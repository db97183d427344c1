use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::bridge::Bridge;
use crate::config::Settings;

/// State shared across all web request handlers
pub struct WebState {
    pub bridge: Arc<Bridge>,
}

/// Create the axum router for the bridge service
pub fn create_router(state: Arc<WebState>, settings: &Settings) -> Router {
    Router::new()
        .merge(super::api::api_routes())
        .merge(super::websocket::ws_routes())
        .layer(cors_layer(&settings.cors.origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any())
}

/// Start the web server
pub async fn start_web_server(
    host: &str,
    port: u16,
    bridge: Arc<Bridge>,
    settings: Arc<Settings>,
) -> Result<()> {
    let state = Arc::new(WebState { bridge });
    let app = create_router(state, &settings);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "Web server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
