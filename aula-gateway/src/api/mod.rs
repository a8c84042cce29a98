pub mod health;
pub mod pending;
pub mod retry;
pub mod sync;
pub mod webhook;

pub fn make_router<S>(state: crate::AppState) -> axum::Router<S> {
    axum::Router::new()
        .route("/health", axum::routing::get(health::get_health))
        .route("/webhook", axum::routing::post(webhook::post_webhook))
        .route("/admin/recordings/retry", axum::routing::post(retry::post_retry))
        .route("/admin/sync/recordings", axum::routing::post(sync::post_sync))
        .route("/admin/recordings/pending", axum::routing::get(pending::get_pending))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
