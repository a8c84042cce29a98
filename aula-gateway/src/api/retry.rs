use axum::extract::State;
use axum::Json;

use crate::http::HttpError;
use crate::republish::{self, RetryRequest, RetryResult};
use crate::AppState;

/// `POST /admin/recordings/retry`: replays or republishes recordings.
pub(crate) async fn post_retry(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<Vec<RetryResult>>, HttpError> {
    republish::validate_selector(&request).map_err(HttpError::bad_request().err())?;

    let results = republish::manual_retry(&state, request)
        .await
        .map_err(HttpError::internal().with_msg("manual retry failed").err())?;

    Ok(Json(results))
}
