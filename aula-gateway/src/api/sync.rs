use axum::extract::State;
use axum::Json;

use crate::http::HttpError;
use crate::republish::{self, SyncRequest, SyncSummary};
use crate::AppState;

/// `POST /admin/sync/recordings`: historical backfill over the provider listing.
pub(crate) async fn post_sync(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncSummary>, HttpError> {
    let summary = republish::sync_recordings(&state, request)
        .await
        .map_err(HttpError::internal().with_msg("backfill failed").err())?;

    Ok(Json(summary))
}
