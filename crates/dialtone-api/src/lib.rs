pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Hex doubles the size of an uploaded file body.
const DOWNLOAD_BODY_LIMIT: usize = 16 * 1024 * 1024;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/online", get(handlers::handle_online))
        .route("/scenes", get(handlers::handle_scenes))
        .route("/fdo/compile", post(handlers::handle_compile))
        .route("/fdo/send", post(handlers::handle_send))
        .route(
            "/xfer/download",
            post(handlers::handle_download).layer(DefaultBodyLimit::max(DOWNLOAD_BODY_LIMIT)),
        )
        .route("/xfer/upload", post(handlers::handle_upload))
        .route("/xfer/{screen_name}", get(handlers::handle_xfer_report))
        .route("/xfer/{screen_name}/cancel", post(handlers::handle_xfer_cancel))
        .route("/xfer/{screen_name}/failed", delete(handlers::handle_xfer_clear_failed))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
