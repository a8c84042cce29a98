use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

use crate::http::HttpError;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PendingQuery {
    #[serde(default)]
    only_without_artifact: bool,
    limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PendingItem {
    internal_meeting_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_meeting_id: Option<String>,
    topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    course_id: Option<i64>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    recording_count: i64,
}

/// `GET /admin/recordings/pending`: candidates for a manual retry.
pub(crate) async fn get_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<PendingItem>>, HttpError> {
    let limit = query.limit.unwrap_or(50);

    let pending = state
        .db
        .pending_meetings(query.only_without_artifact, limit)
        .await
        .map_err(HttpError::internal().with_msg("pending listing failed").err())?;

    let items = pending
        .into_iter()
        .map(|entry| PendingItem {
            internal_meeting_id: entry.meeting.id,
            external_meeting_id: entry.meeting.zoom_meeting_id,
            topic: entry.meeting.topic,
            course_id: entry.meeting.course_id,
            status: match entry.meeting.status {
                crate::db::MeetingStatus::Completed => "completed",
                crate::db::MeetingStatus::Scheduled => "scheduled",
            },
            start_time: entry
                .meeting
                .start_time
                .and_then(|start| start.format(&Rfc3339).ok()),
            recording_count: entry.recording_count,
        })
        .collect();

    Ok(Json(items))
}
