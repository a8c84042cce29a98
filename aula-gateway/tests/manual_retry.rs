#![allow(clippy::unwrap_used)]

mod common;

use aula_gateway::db::{MeetingRow, RecordingRow};
use aula_gateway::republish::{manual_retry, RetryMode, RetryRequest, RetryStatus};
use time::macros::datetime;

async fn seed_recording(state: &aula_gateway::AppState, zoom_meeting_id: &str, zoom_recording_id: &str) -> MeetingRow {
    let meeting = MeetingRow::synthesized(zoom_meeting_id, "Matemáticas Básicas", 13, None);
    state.db.insert_meeting(&meeting).await.unwrap();

    let recording = RecordingRow::new(
        &meeting.id,
        zoom_recording_id,
        "https://drive.google.com/file/d/1AbC/view",
    );
    state.db.insert_recording(&recording).await.unwrap();

    meeting
}

#[tokio::test]
async fn dry_run_republish_reports_skipped_without_side_effects() {
    let harness = common::harness().await;
    seed_recording(&harness.state, "94881330838", "abc123").await;

    let request = RetryRequest {
        external_recording_id: Some("abc123".to_owned()),
        republish: true,
        dry_run: true,
        ..Default::default()
    };

    let results = manual_retry(&harness.state, request).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].mode, RetryMode::Republish);
    assert_eq!(results[0].status, RetryStatus::Skipped);
    assert_eq!(results[0].reason.as_deref(), Some("dry-run"));
    assert_eq!(results[0].external_recording_id.as_deref(), Some("abc123"));

    // No retry counter movement on a dry run.
    let recording = harness
        .state
        .db
        .find_recording_by_zoom_recording_id("abc123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recording.retry_count, 0);
    assert!(recording.last_retry_at.is_none());
}

#[tokio::test]
async fn dry_run_without_artifact_falls_back_to_full_mode() {
    let harness = common::harness().await;

    let meeting = MeetingRow::synthesized("94881330838", "Matemáticas Básicas", 13, None);
    harness.state.db.insert_meeting(&meeting).await.unwrap();

    let request = RetryRequest {
        external_meeting_id: Some("94881330838".to_owned()),
        republish: true,
        dry_run: true,
        ..Default::default()
    };

    let results = manual_retry(&harness.state, request).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].mode, RetryMode::Full);
    assert_eq!(results[0].status, RetryStatus::Skipped);
    assert_eq!(results[0].reason.as_deref(), Some("dry-run"));
}

#[tokio::test]
async fn time_range_dry_run_is_bounded_by_limit() {
    let harness = common::harness().await;

    for index in 0..5 {
        seed_recording(
            &harness.state,
            &format!("9488133083{index}"),
            &format!("rec-{index}"),
        )
        .await;
    }

    let request = RetryRequest {
        from: Some(datetime!(2000-01-01 00:00:00 UTC)),
        to: Some(datetime!(2100-01-01 00:00:00 UTC)),
        dry_run: true,
        limit: Some(3),
        ..Default::default()
    };

    let results = manual_retry(&harness.state, request).await.unwrap();

    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result.status, RetryStatus::Skipped);
        assert_eq!(result.reason.as_deref(), Some("dry-run"));
    }
}

#[tokio::test]
async fn selector_must_be_exactly_one() {
    let harness = common::harness().await;

    let request = RetryRequest {
        external_recording_id: Some("abc123".to_owned()),
        external_meeting_id: Some("94881330838".to_owned()),
        ..Default::default()
    };

    assert!(manual_retry(&harness.state, request).await.is_err());
    assert!(manual_retry(&harness.state, RetryRequest::default()).await.is_err());
}

#[tokio::test]
async fn concurrent_retry_of_the_same_target_is_reported_in_progress() {
    let harness = common::harness().await;
    seed_recording(&harness.state, "94881330838", "abc123").await;

    // Hold the guard the engine would need.
    let _guard = harness.state.guards.begin_retry("recording:abc123").unwrap();

    let request = RetryRequest {
        external_recording_id: Some("abc123".to_owned()),
        republish: true,
        ..Default::default()
    };

    let results = manual_retry(&harness.state, request).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, RetryStatus::Skipped);
    assert_eq!(results[0].reason.as_deref(), Some("already-in-progress"));
}
