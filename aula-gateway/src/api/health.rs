use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub(crate) struct Identity {
    id: &'static str,
    version: &'static str,
}

pub(crate) async fn get_health(State(_state): State<AppState>) -> Json<Identity> {
    Json(Identity {
        id: "aula-gateway",
        version: env!("CARGO_PKG_VERSION"),
    })
}
