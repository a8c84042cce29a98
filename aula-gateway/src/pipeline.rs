use std::time::Duration;

use anyhow::Context as _;
use tap::Pipe as _;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use url::Url;

use crate::db::{MeetingRow, MeetingStatus, RecordingRow};
use crate::drive::UploadTags;
use crate::resolver::CourseResolver;
use crate::zoom::{MeetingRecordings, RecordingFile};
use crate::AppState;

/// Upper bound on the best-effort wait for the store's preview generation.
const PREVIEW_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
const PREVIEW_WAIT_POLL: Duration = Duration::from_secs(10);

const TOPIC_MAX_LEN: usize = 50;

#[derive(Debug, Clone)]
pub enum PipelineStatus {
    Done { drive_url: String },
    InFlight,
    Ignored { reason: String },
}

/// Entry point for `recording.completed` webhooks.
///
/// Idempotent: replaying a payload that was already processed observes the
/// existing row or stored artifact and short-circuits to `Done`.
#[instrument(skip_all, fields(meeting_id = %object.id, topic = %object.topic))]
pub async fn process_completed_recording(
    state: &AppState,
    object: MeetingRecordings,
    download_token: Option<String>,
) -> anyhow::Result<PipelineStatus> {
    let Some(file) = crate::zoom::select_mp4_file(&object.recording_files) else {
        debug!("No usable MP4 in the webhook payload");
        return Ok(PipelineStatus::Ignored {
            reason: "no-drive-url-found".to_owned(),
        });
    };
    let file = file.clone();

    // Held for the whole pipeline; dropping it (on any exit path) releases
    // the in-flight marker.
    let Some(_guard) = state.guards.begin_meeting(&object.id) else {
        debug!("A pipeline for this meeting is already running");
        return Ok(PipelineStatus::InFlight);
    };

    let meeting = match admit_meeting(state, &object).await? {
        AdmittedMeeting::Known(meeting) => meeting,
        AdmittedMeeting::NoCourse => {
            return Ok(PipelineStatus::Ignored {
                reason: "no-course-resolved".to_owned(),
            });
        }
    };

    // Idempotency probe #1: our own books.
    if let Some(existing) = state.db.find_recording_by_zoom_recording_id(&file.id).await? {
        debug!(recording_id = %file.id, "Recording row already exists");
        finalize_meeting(state, &meeting).await?;
        return Ok(PipelineStatus::Done {
            drive_url: existing.drive_url,
        });
    }

    // Idempotency probe #2: the object store's tag index.
    if let Some(stored) = state.drive.find_by_recording_id(&file.id).await? {
        debug!(recording_id = %file.id, file_id = %stored.id, "Artifact already stored");

        let drive_url = stored
            .web_view_link
            .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", stored.id));

        state
            .db
            .insert_recording(&RecordingRow::new(&meeting.id, &file.id, &drive_url))
            .await?;
        finalize_meeting(state, &meeting).await?;

        return Ok(PipelineStatus::Done { drive_url });
    }

    let drive_url = execute_pipeline(state, &meeting, &file, download_token.as_deref()).await?;

    Ok(PipelineStatus::Done { drive_url })
}

enum AdmittedMeeting {
    Known(MeetingRow),
    NoCourse,
}

/// Loads the meeting row, synthesizing one (with a resolved course) when the
/// webhook references an external id we have never seen.
async fn admit_meeting(state: &AppState, object: &MeetingRecordings) -> anyhow::Result<AdmittedMeeting> {
    let resolver = CourseResolver::new(std::sync::Arc::clone(&state.moodle));

    match state.db.find_meeting_by_zoom_id(&object.id).await? {
        Some(meeting) if meeting.course_id.is_some() => Ok(AdmittedMeeting::Known(meeting)),
        Some(mut meeting) => {
            // Row exists but was never bound to a course.
            match resolver.resolve(&object.topic).await? {
                Some(course_id) => {
                    state.db.set_meeting_course(&meeting.id, course_id).await?;
                    meeting.course_id = Some(course_id);
                    Ok(AdmittedMeeting::Known(meeting))
                }
                None => {
                    warn!(topic = %object.topic, "No course resolved for an unbound meeting");
                    Ok(AdmittedMeeting::NoCourse)
                }
            }
        }
        None => match resolver.resolve(&object.topic).await? {
            Some(course_id) => {
                let meeting = MeetingRow::synthesized(&object.id, &object.topic, course_id, object.start_time);
                state.db.insert_meeting(&meeting).await?;
                info!(course_id, "Meeting synthesized from the webhook");
                Ok(AdmittedMeeting::Known(meeting))
            }
            None => {
                warn!(topic = %object.topic, "No course resolved, ignoring the event");
                Ok(AdmittedMeeting::NoCourse)
            }
        },
    }
}

/// The full download → upload → publish pipeline for one recording file.
///
/// The caller must already hold the in-flight guard for the meeting.
#[instrument(skip_all, fields(recording_id = %file.id))]
pub(crate) async fn execute_pipeline(
    state: &AppState,
    meeting: &MeetingRow,
    file: &RecordingFile,
    download_token: Option<&str>,
) -> anyhow::Result<String> {
    let conf = state.conf_handle.get_conf();

    let course_id = meeting.course_id.context("meeting has no course binding")?;

    let download_url = file
        .download_url
        .as_deref()
        .context("selected recording file has no download URL")?
        .pipe(Url::parse)
        .context("invalid download URL")?;

    let local_path = conf
        .downloads_dir
        .join(recording_file_name(&meeting.topic, meeting.start_time, &file.id));

    // Serialize everything touching this local path.
    let _path_lock = state.guards.lock_path(&local_path).await;

    crate::download::download_recording(
        &state.zoom,
        &download_url,
        &local_path,
        download_token,
        file.file_size,
        &conf.transfers,
    )
    .await
    .context("download failed")?;

    let course_folder = state
        .drive
        .ensure_folder(&conf.drive.root_folder_id, &course_id.to_string())
        .await
        .context("couldn't ensure the course folder")?;

    let month_folder = state
        .drive
        .ensure_folder(&course_folder, &month_folder_name(meeting.start_time))
        .await
        .context("couldn't ensure the month folder")?;

    let tags = UploadTags {
        meeting_id: meeting.id.clone(),
        course_id,
        external_recording_id: file.id.clone(),
    };

    let uploaded = {
        let _upload_slot = state.guards.acquire_upload_slot().await;

        crate::drive::upload_recording(
            &state.drive,
            &local_path,
            local_path.file_name().unwrap_or("recording.mp4"),
            &month_folder,
            &tags,
            &conf.transfers,
        )
        .await
        .context("upload failed")?
    };

    if let Err(error) = state.drive.grant_public_reader(&uploaded.file_id).await {
        warn!(
            file_id = %uploaded.file_id,
            error = format!("{error:#}"),
            "Couldn't grant read permissions, the artifact stays restricted"
        );
    }

    wait_for_preview(state, &uploaded.file_id).await;

    tokio::time::sleep(conf.transfers.prepublish_delay).await;

    let forum_id = state
        .moodle
        .resolve_forum_id(course_id)
        .await
        .context("couldn't resolve the target forum")?;

    let subject = discussion_subject(
        &meeting.topic,
        meeting.start_time.unwrap_or_else(OffsetDateTime::now_utc),
        &file.id,
    );
    let message = crate::moodle::preview_embed_html(&uploaded.view_url);

    state
        .moodle
        .create_discussion(forum_id, &subject, &message)
        .await
        .context("couldn't post the discussion")?;

    state
        .db
        .insert_recording(&RecordingRow::new(&meeting.id, &file.id, &uploaded.view_url))
        .await?;

    finalize_meeting(state, meeting).await?;

    if let Err(error) = tokio::fs::remove_file(local_path.as_std_path()).await {
        warn!(path = %local_path, %error, "Couldn't delete the local file");
    }

    info!(drive_url = %uploaded.view_url, "Recording published");

    Ok(uploaded.view_url)
}

/// Marks the meeting completed and frees its license slot.
async fn finalize_meeting(state: &AppState, meeting: &MeetingRow) -> anyhow::Result<()> {
    if meeting.status != MeetingStatus::Completed {
        state.db.set_meeting_completed(&meeting.id).await?;
    }

    let released = state.db.release_license(&meeting.id).await?;
    if !released {
        // Synthesized meetings never held a license.
        debug!(meeting_id = %meeting.id, "No license slot to release");
    }

    Ok(())
}

/// Best effort: give the store a chance to generate the preview before the
/// discussion goes out. Never fails the pipeline.
async fn wait_for_preview(state: &AppState, file_id: &str) {
    let deadline = tokio::time::Instant::now() + PREVIEW_WAIT_TIMEOUT;

    loop {
        match state.drive.get_metadata(file_id).await {
            Ok(meta) if meta.has_thumbnail || meta.is_video_ready() => {
                debug!(file_id, "Preview is ready");
                return;
            }
            Ok(_) => {}
            Err(error) => {
                debug!(file_id, error = format!("{error:#}"), "Preview probe failed");
            }
        }

        if tokio::time::Instant::now() + PREVIEW_WAIT_POLL > deadline {
            debug!(file_id, "Preview still not ready, publishing anyway");
            return;
        }

        tokio::time::sleep(PREVIEW_WAIT_POLL).await;
    }
}

/// `<sanitized-topic>_<ISO-timestamp>_<externalRecordingId>.mp4`
pub(crate) fn recording_file_name(topic: &str, start_time: Option<OffsetDateTime>, recording_id: &str) -> String {
    let timestamp = start_time
        .unwrap_or_else(OffsetDateTime::now_utc)
        .format(&Rfc3339)
        .unwrap_or_default()
        .replace(':', "-");

    format!("{}_{}_{}.mp4", sanitize_topic(topic), timestamp, sanitize_topic(recording_id))
}

/// Replaces anything outside `[A-Za-z0-9_-]` and keeps at most 50 characters.
pub(crate) fn sanitize_topic(topic: &str) -> String {
    topic
        .chars()
        .take(TOPIC_MAX_LEN)
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// `<topic> | <yyyy-MM-dd> [<recordingId>]`
pub(crate) fn discussion_subject(topic: &str, date: OffsetDateTime, recording_id: &str) -> String {
    let format = format_description!("[year]-[month]-[day]");
    let day = date.format(&format).unwrap_or_default();
    format!("{topic} | {day} [{recording_id}]")
}

/// Folder name for the month bucket, `yyyy-MM`.
pub(crate) fn month_folder_name(start_time: Option<OffsetDateTime>) -> String {
    let format = format_description!("[year]-[month]");
    start_time
        .unwrap_or_else(OffsetDateTime::now_utc)
        .format(&format)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn file_name_is_sanitized_and_stamped() {
        let name = recording_file_name(
            "Matemáticas Básicas (EP) - Lunes",
            Some(datetime!(2025-08-18 10:30:00 UTC)),
            "abc123",
        );

        assert_eq!(name, "Matem_ticas_B_sicas__EP__-_Lunes_2025-08-18T10-30-00Z_abc123.mp4");
    }

    #[test]
    fn topic_is_truncated_to_fifty_chars() {
        let long_topic = "a".repeat(80);
        let sanitized = sanitize_topic(&long_topic);
        assert_eq!(sanitized.len(), 50);
    }

    #[test]
    fn subject_carries_date_and_recording_id() {
        let subject = discussion_subject("Matemáticas Básicas", datetime!(2025-08-18 10:30:00 UTC), "abc123");
        assert_eq!(subject, "Matemáticas Básicas | 2025-08-18 [abc123]");
    }

    #[test]
    fn month_folder_is_year_dash_month() {
        assert_eq!(month_folder_name(Some(datetime!(2025-08-18 10:30:00 UTC))), "2025-08");
    }
}
