use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::db::{MeetingRow, MeetingStatus, RecordingRow};
use crate::pipeline::{self, PipelineStatus};
use crate::resolver::CourseResolver;
use crate::zoom::MeetingRecordings;
use crate::AppState;

const DEFAULT_LIMIT: u32 = 5;
const DEFAULT_SYNC_MAX_PAGES: u32 = 10;

pub const REASON_ALREADY_COMPLETED: &str = "already-completed";
pub const REASON_NO_COURSE: &str = "no-course-resolved";
pub const REASON_NO_DRIVE_URL: &str = "no-drive-url-found";
pub const REASON_IN_PROGRESS: &str = "already-in-progress";
pub const REASON_DRY_RUN: &str = "dry-run";

/// Admin request; exactly one selector must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub external_recording_id: Option<String>,
    pub internal_meeting_id: Option<String>,
    pub external_meeting_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    #[serde(default)]
    pub republish: bool,
    #[serde(default)]
    pub force_redownload: bool,
    /// Declared for API compatibility; behaves like `republish`.
    #[serde(default)]
    pub force_repost: bool,
    pub override_course_id: Option<i64>,
    #[serde(default)]
    pub dry_run: bool,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    Republish,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    pub selector: String,
    pub mode: RetryMode,
    pub status: RetryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_meeting_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_meeting_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_url: Option<String>,
}

/// One resolved retry target.
#[derive(Debug, Clone)]
struct RetryTarget {
    selector: String,
    recording: Option<RecordingRow>,
    meeting: Option<MeetingRow>,
    external_meeting_id: Option<String>,
    topic: Option<String>,
}

impl RetryTarget {
    fn guard_key(&self) -> String {
        if let Some(recording) = &self.recording {
            format!("recording:{}", recording.zoom_recording_id)
        } else if let Some(external) = &self.external_meeting_id {
            format!("meeting:{external}")
        } else if let Some(meeting) = &self.meeting {
            format!("meeting:{}", meeting.id)
        } else {
            format!("selector:{}", self.selector)
        }
    }

    fn result(&self, mode: RetryMode, status: RetryStatus, reason: Option<&str>) -> RetryResult {
        RetryResult {
            selector: self.selector.clone(),
            mode,
            status,
            reason: reason.map(str::to_owned),
            external_recording_id: self.recording.as_ref().map(|r| r.zoom_recording_id.clone()),
            external_meeting_id: self
                .external_meeting_id
                .clone()
                .or_else(|| self.meeting.as_ref().and_then(|m| m.zoom_meeting_id.clone())),
            internal_meeting_id: self.meeting.as_ref().map(|m| m.id.clone()),
            drive_url: self.recording.as_ref().map(|r| r.drive_url.clone()),
        }
    }
}

/// Runs the manual-retry batch. One failing target never aborts the others.
#[instrument(skip_all)]
pub async fn manual_retry(state: &AppState, request: RetryRequest) -> anyhow::Result<Vec<RetryResult>> {
    validate_selector(&request)?;

    let limit = request.limit.unwrap_or(DEFAULT_LIMIT);
    let targets = resolve_targets(state, &request, limit).await?;

    info!(target_count = targets.len(), dry_run = request.dry_run, "Manual retry batch");

    let mut results = Vec::with_capacity(targets.len());

    for target in targets {
        results.push(process_target(state, &request, target).await);
    }

    Ok(results)
}

pub(crate) fn validate_selector(request: &RetryRequest) -> anyhow::Result<()> {
    let range_selector = request.from.is_some() || request.to.is_some();

    let selector_count = [
        request.external_recording_id.is_some(),
        request.internal_meeting_id.is_some(),
        request.external_meeting_id.is_some(),
        range_selector,
    ]
    .into_iter()
    .filter(|present| *present)
    .count();

    anyhow::ensure!(
        selector_count == 1,
        "exactly one of externalRecordingId, internalMeetingId, externalMeetingId or from/to must be provided"
    );

    if range_selector {
        anyhow::ensure!(
            request.from.is_some() && request.to.is_some(),
            "a time-range selector needs both from and to"
        );
    }

    Ok(())
}

async fn resolve_targets(state: &AppState, request: &RetryRequest, limit: u32) -> anyhow::Result<Vec<RetryTarget>> {
    if let Some(recording_id) = &request.external_recording_id {
        let selector = format!("externalRecordingId={recording_id}");
        let recording = state.db.find_recording_by_zoom_recording_id(recording_id).await?;

        let meeting = match &recording {
            Some(recording) => state.db.find_meeting_by_id(&recording.meeting_id).await?,
            None => None,
        };

        return Ok(vec![RetryTarget {
            selector,
            topic: meeting.as_ref().map(|m| m.topic.clone()),
            external_meeting_id: meeting.as_ref().and_then(|m| m.zoom_meeting_id.clone()),
            recording,
            meeting,
        }]);
    }

    if let Some(meeting_id) = &request.internal_meeting_id {
        let selector = format!("internalMeetingId={meeting_id}");
        let meeting = state.db.find_meeting_by_id(meeting_id).await?;

        let recording = match &meeting {
            Some(meeting) => state
                .db
                .find_recordings_by_meeting(&meeting.id)
                .await?
                .into_iter()
                .next(),
            None => None,
        };

        return Ok(vec![RetryTarget {
            selector,
            topic: meeting.as_ref().map(|m| m.topic.clone()),
            external_meeting_id: meeting.as_ref().and_then(|m| m.zoom_meeting_id.clone()),
            recording,
            meeting,
        }]);
    }

    if let Some(external_id) = &request.external_meeting_id {
        let selector = format!("externalMeetingId={external_id}");
        let meeting = state.db.find_meeting_by_zoom_id(external_id).await?;

        let (recording, topic) = match &meeting {
            Some(meeting) => (
                state
                    .db
                    .find_recordings_by_meeting(&meeting.id)
                    .await?
                    .into_iter()
                    .next(),
                Some(meeting.topic.clone()),
            ),
            None => {
                // Unknown meeting: ask the provider so the course resolver has
                // a topic to work with.
                let topic = state
                    .zoom
                    .meeting_recordings(external_id)
                    .await
                    .map(|object| object.topic)
                    .ok();
                (None, topic)
            }
        };

        return Ok(vec![RetryTarget {
            selector,
            topic,
            external_meeting_id: Some(external_id.clone()),
            recording,
            meeting,
        }]);
    }

    let (Some(from), Some(to)) = (request.from, request.to) else {
        anyhow::bail!("a time-range selector needs both from and to");
    };

    let recordings = state.db.recordings_created_between(from, to, limit).await?;
    let mut targets = Vec::with_capacity(recordings.len());

    for recording in recordings {
        let meeting = state.db.find_meeting_by_id(&recording.meeting_id).await?;

        targets.push(RetryTarget {
            selector: format!("from={from}&to={to}"),
            topic: meeting.as_ref().map(|m| m.topic.clone()),
            external_meeting_id: meeting.as_ref().and_then(|m| m.zoom_meeting_id.clone()),
            recording: Some(recording),
            meeting,
        });
    }

    Ok(targets)
}

fn determine_mode(request: &RetryRequest, target: &RetryTarget) -> RetryMode {
    if request.force_redownload {
        return RetryMode::Full;
    }

    let has_artifact = target
        .recording
        .as_ref()
        .is_some_and(|recording| !recording.drive_url.is_empty());

    if (request.republish || request.force_repost) && has_artifact {
        RetryMode::Republish
    } else {
        RetryMode::Full
    }
}

async fn process_target(state: &AppState, request: &RetryRequest, target: RetryTarget) -> RetryResult {
    let mode = determine_mode(request, &target);

    if request.dry_run {
        return target.result(mode, RetryStatus::Skipped, Some(REASON_DRY_RUN));
    }

    // Concurrent retries of the same target surface `already-in-progress`.
    let Some(_retry_guard) = state.guards.begin_retry(&target.guard_key()) else {
        return target.result(mode, RetryStatus::Skipped, Some(REASON_IN_PROGRESS));
    };

    let outcome = match mode {
        RetryMode::Republish => republish_target(state, request, &target).await,
        RetryMode::Full => full_target(state, request, &target).await,
    };

    match outcome {
        Ok(result) => result,
        Err(error) => {
            error!(
                selector = %target.selector,
                error = format!("{error:#}"),
                "Retry target failed"
            );
            let mut result = target.result(mode, RetryStatus::Failed, None);
            result.reason = Some(format!("{error:#}"));
            result
        }
    }
}

/// Posts a fresh discussion for an artifact that is already stored.
async fn republish_target(
    state: &AppState,
    request: &RetryRequest,
    target: &RetryTarget,
) -> anyhow::Result<RetryResult> {
    let recording = target
        .recording
        .as_ref()
        .expect("republish mode implies an existing recording");

    let topic = target
        .topic
        .clone()
        .unwrap_or_else(|| "Clase grabada".to_owned());

    let course_id = match request
        .override_course_id
        .or_else(|| target.meeting.as_ref().and_then(|m| m.course_id))
    {
        Some(course_id) => course_id,
        None => match CourseResolver::new(std::sync::Arc::clone(&state.moodle)).resolve(&topic).await? {
            Some(course_id) => course_id,
            None => return Ok(target.result(RetryMode::Republish, RetryStatus::Skipped, Some(REASON_NO_COURSE))),
        },
    };

    let forum_id = state.moodle.resolve_forum_id(course_id).await?;

    let subject = pipeline::discussion_subject(&topic, OffsetDateTime::now_utc(), &recording.zoom_recording_id);
    let message = crate::moodle::preview_embed_html(&recording.drive_url);

    state.moodle.create_discussion(forum_id, &subject, &message).await?;
    state.db.increment_retry_count(&recording.id).await?;

    info!(recording_id = %recording.zoom_recording_id, forum_id, "Recording republished");

    let mut result = target.result(RetryMode::Republish, RetryStatus::Ok, Some("republished-successfully"));
    result.drive_url = Some(recording.drive_url.clone());
    Ok(result)
}

/// Re-runs the whole pipeline against the provider's current file list.
async fn full_target(state: &AppState, request: &RetryRequest, target: &RetryTarget) -> anyhow::Result<RetryResult> {
    let already_done = target
        .meeting
        .as_ref()
        .is_some_and(|meeting| meeting.status == MeetingStatus::Completed)
        && target.recording.is_some();

    if already_done && !request.force_redownload {
        return Ok(target.result(RetryMode::Full, RetryStatus::Skipped, Some(REASON_ALREADY_COMPLETED)));
    }

    let Some(external_meeting_id) = target
        .external_meeting_id
        .clone()
        .or_else(|| target.meeting.as_ref().and_then(|m| m.zoom_meeting_id.clone()))
    else {
        anyhow::bail!("the target has no external meeting id to query the provider with");
    };

    let object: MeetingRecordings = state.zoom.meeting_recordings(&external_meeting_id).await?;

    if crate::zoom::select_mp4_file(&object.recording_files).is_none() {
        return Ok(target.result(RetryMode::Full, RetryStatus::Skipped, Some(REASON_NO_DRIVE_URL)));
    }

    if let Some(course_id) = request.override_course_id {
        match &target.meeting {
            Some(meeting) => state.db.set_meeting_course(&meeting.id, course_id).await?,
            None => {
                // No row yet: seed the meeting with the override so admission
                // doesn't depend on automatic topic resolution.
                let meeting = MeetingRow::synthesized(&object.id, &object.topic, course_id, object.start_time);
                state.db.insert_meeting(&meeting).await?;
                info!(course_id, external_meeting_id = %object.id, "Meeting seeded with the course override");
            }
        }
    }

    match pipeline::process_completed_recording(state, object, None).await? {
        PipelineStatus::Done { drive_url } => {
            let mut result = target.result(RetryMode::Full, RetryStatus::Ok, Some("processed"));
            result.drive_url = Some(drive_url);
            Ok(result)
        }
        PipelineStatus::InFlight => Ok(target.result(RetryMode::Full, RetryStatus::Skipped, Some(REASON_IN_PROGRESS))),
        PipelineStatus::Ignored { reason } => {
            Ok(target.result(RetryMode::Full, RetryStatus::Skipped, Some(reason.as_str())))
        }
    }
}

// == Historical backfill == //

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// `YYYY-MM-DD`
    pub from: String,
    /// `YYYY-MM-DD`
    pub to: String,
    #[serde(default)]
    pub dry_run: bool,
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub only_missing_meetings: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub total_found: u32,
    pub new_created: u32,
    pub existing_found: u32,
    pub files_processed: u32,
    pub errors: Vec<String>,
    pub per_item: Vec<SyncItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub external_meeting_id: String,
    pub topic: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Walks the provider's recordings listing for a date window and replays each
/// meeting through the idempotent pipeline.
#[instrument(skip_all, fields(from = %request.from, to = %request.to, dry_run = request.dry_run))]
pub async fn sync_recordings(state: &AppState, request: SyncRequest) -> anyhow::Result<SyncSummary> {
    let date_format = format_description!("[year]-[month]-[day]");

    let from = Date::parse(&request.from, &date_format)
        .map_err(|_| anyhow::anyhow!("invalid from date: {}", request.from))?;
    let to = Date::parse(&request.to, &date_format).map_err(|_| anyhow::anyhow!("invalid to date: {}", request.to))?;

    let max_pages = request.max_pages.unwrap_or(DEFAULT_SYNC_MAX_PAGES);

    let mut summary = SyncSummary::default();
    let mut page_token: Option<String> = None;

    for _page in 0..max_pages {
        let page = state.zoom.list_recordings(from, to, page_token.as_deref()).await?;

        for object in page.meetings {
            summary.total_found += 1;

            if let Err(error) = sync_one_meeting(state, &request, object, &mut summary).await {
                summary.errors.push(format!("{error:#}"));
            }
        }

        page_token = page.next_page_token.filter(|token| !token.is_empty());

        if page_token.is_none() {
            break;
        }
    }

    info!(
        total_found = summary.total_found,
        new_created = summary.new_created,
        existing_found = summary.existing_found,
        files_processed = summary.files_processed,
        error_count = summary.errors.len(),
        "Backfill finished"
    );

    Ok(summary)
}

async fn sync_one_meeting(
    state: &AppState,
    request: &SyncRequest,
    object: MeetingRecordings,
    summary: &mut SyncSummary,
) -> anyhow::Result<()> {
    let known = state.db.find_meeting_by_zoom_id(&object.id).await?;

    if known.is_some() {
        summary.existing_found += 1;
    } else if request.dry_run {
        summary.per_item.push(SyncItem {
            external_meeting_id: object.id.clone(),
            topic: object.topic.clone(),
            status: "would-create".to_owned(),
            detail: None,
        });
    } else {
        let resolver = CourseResolver::new(std::sync::Arc::clone(&state.moodle));

        match resolver.resolve(&object.topic).await? {
            Some(course_id) => {
                let meeting = MeetingRow::synthesized(&object.id, &object.topic, course_id, object.start_time);
                state.db.insert_meeting(&meeting).await?;
                summary.new_created += 1;
            }
            None => {
                summary.per_item.push(SyncItem {
                    external_meeting_id: object.id.clone(),
                    topic: object.topic.clone(),
                    status: "skipped".to_owned(),
                    detail: Some(REASON_NO_COURSE.to_owned()),
                });
                return Ok(());
            }
        }
    }

    if request.only_missing_meetings {
        return Ok(());
    }

    if request.dry_run {
        if crate::zoom::select_mp4_file(&object.recording_files).is_some() {
            summary.per_item.push(SyncItem {
                external_meeting_id: object.id.clone(),
                topic: object.topic.clone(),
                status: "would-process".to_owned(),
                detail: None,
            });
        }
        return Ok(());
    }

    let external_meeting_id = object.id.clone();
    let topic = object.topic.clone();

    match pipeline::process_completed_recording(state, object, None).await? {
        PipelineStatus::Done { drive_url } => {
            summary.files_processed += 1;
            summary.per_item.push(SyncItem {
                external_meeting_id,
                topic,
                status: "processed".to_owned(),
                detail: Some(drive_url),
            });
        }
        PipelineStatus::InFlight => {
            summary.per_item.push(SyncItem {
                external_meeting_id,
                topic,
                status: "skipped".to_owned(),
                detail: Some(REASON_IN_PROGRESS.to_owned()),
            });
        }
        PipelineStatus::Ignored { reason } => {
            summary.per_item.push(SyncItem {
                external_meeting_id,
                topic,
                status: "skipped".to_owned(),
                detail: Some(reason),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(url: &str) -> RecordingRow {
        RecordingRow::new("m-1", "abc123", url)
    }

    fn target_with(recording_row: Option<RecordingRow>) -> RetryTarget {
        RetryTarget {
            selector: "externalRecordingId=abc123".to_owned(),
            recording: recording_row,
            meeting: None,
            external_meeting_id: Some("94881330838".to_owned()),
            topic: Some("Matemáticas Básicas".to_owned()),
        }
    }

    #[test]
    fn selector_validation_requires_exactly_one() {
        assert!(validate_selector(&RetryRequest::default()).is_err());

        let ok = RetryRequest {
            external_recording_id: Some("abc123".to_owned()),
            ..Default::default()
        };
        assert!(validate_selector(&ok).is_ok());

        let two = RetryRequest {
            external_recording_id: Some("abc123".to_owned()),
            external_meeting_id: Some("94881330838".to_owned()),
            ..Default::default()
        };
        assert!(validate_selector(&two).is_err());

        let half_range = RetryRequest {
            from: Some(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        assert!(validate_selector(&half_range).is_err());
    }

    #[test]
    fn republish_needs_an_existing_artifact() {
        let request = RetryRequest {
            republish: true,
            ..Default::default()
        };

        let with_artifact = target_with(Some(recording("https://drive.google.com/file/d/x/view")));
        assert_eq!(determine_mode(&request, &with_artifact), RetryMode::Republish);

        let without_artifact = target_with(None);
        assert_eq!(determine_mode(&request, &without_artifact), RetryMode::Full);

        let empty_url = target_with(Some(recording("")));
        assert_eq!(determine_mode(&request, &empty_url), RetryMode::Full);
    }

    #[test]
    fn force_redownload_always_wins() {
        let request = RetryRequest {
            republish: true,
            force_redownload: true,
            ..Default::default()
        };

        let with_artifact = target_with(Some(recording("https://drive.google.com/file/d/x/view")));
        assert_eq!(determine_mode(&request, &with_artifact), RetryMode::Full);
    }

    #[test]
    fn force_repost_behaves_like_republish() {
        let request = RetryRequest {
            force_repost: true,
            ..Default::default()
        };

        let with_artifact = target_with(Some(recording("https://drive.google.com/file/d/x/view")));
        assert_eq!(determine_mode(&request, &with_artifact), RetryMode::Republish);
    }
}
