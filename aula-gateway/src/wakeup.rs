use std::time::Duration;

use async_trait::async_trait;
use aula_gateway_task::{ShutdownSignal, Task};
use time::{Duration as TimeDuration, OffsetDateTime, Time, UtcOffset};
use url::Url;

use crate::db::RecordingRow;
use crate::drive;
use crate::AppState;

/// A recording is left alone for this long after a wakeup poke.
const WAKEUP_COOLDOWN: TimeDuration = TimeDuration::minutes(90);

const MAX_WAKEUP_ATTEMPTS: i64 = 2;

/// Daily job re-probing stored artifacts whose preview generation stalled.
///
/// Some uploads sit in the store's processing queue forever unless something
/// touches them; a passive HEAD on the preview endpoint is enough of a nudge.
pub struct PreviewWakeupTask {
    pub state: AppState,
}

#[async_trait]
impl Task for PreviewWakeupTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "preview wakeup";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

        loop {
            let hour = self.state.conf_handle.get_conf().wakeup_hour;
            let now = OffsetDateTime::now_utc().to_offset(offset);
            let next_run = next_run_after(now, hour);

            let sleep_for = next_run - now;
            let sleep_for = Duration::try_from(sleep_for).unwrap_or(Duration::from_secs(60));

            debug!(%next_run, "Sleeping until the next wakeup pass");

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                () = shutdown_signal.wait() => break,
            }

            if let Err(error) = run_wakeup_pass(&self.state, offset).await {
                warn!(error = format!("{error:#}"), "Wakeup pass failed");
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

/// Next `hour:00:00` strictly after `now`, in `now`'s offset.
fn next_run_after(now: OffsetDateTime, hour: u8) -> OffsetDateTime {
    let at = Time::from_hms(hour.min(23), 0, 0).unwrap_or(Time::MIDNIGHT);
    let candidate = now.replace_time(at);

    if candidate > now {
        candidate
    } else {
        candidate + TimeDuration::days(1)
    }
}

/// The previous calendar day, as a half-open UTC interval.
fn previous_day_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let today_midnight = now.replace_time(Time::MIDNIGHT);
    (today_midnight - TimeDuration::days(1), today_midnight)
}

#[instrument(skip_all)]
pub async fn run_wakeup_pass(state: &AppState, offset: UtcOffset) -> anyhow::Result<()> {
    let now = OffsetDateTime::now_utc().to_offset(offset);
    let (window_start, window_end) = previous_day_window(now);
    let cooldown_cutoff = OffsetDateTime::now_utc() - WAKEUP_COOLDOWN;

    let candidates = state
        .db
        .wakeup_candidates(window_start, window_end, cooldown_cutoff)
        .await?;

    info!(candidate_count = candidates.len(), "Wakeup pass");

    for recording in candidates {
        if let Err(error) = wake_recording(state, &recording).await {
            warn!(
                recording_id = %recording.zoom_recording_id,
                error = format!("{error:#}"),
                "Couldn't wake the recording preview"
            );
        }
    }

    Ok(())
}

async fn wake_recording(state: &AppState, recording: &RecordingRow) -> anyhow::Result<()> {
    let Some(file_id) = drive::extract_file_id(&recording.drive_url) else {
        warn!(drive_url = %recording.drive_url, "No artifact id in the stored URL");
        state
            .db
            .record_wakeup_attempt(&recording.id, recording.wakeup_attempts + 1)
            .await?;
        return Ok(());
    };

    let meta = state.drive.get_metadata(&file_id).await?;

    if meta.has_thumbnail && !meta.is_video_ready() {
        // A thumbnail without a ready status means the store is already on
        // it; poking again would change nothing.
        debug!(file_id, "Store is mid-processing, giving up on this recording");
        state
            .db
            .record_wakeup_attempt(&recording.id, MAX_WAKEUP_ATTEMPTS)
            .await?;
        return Ok(());
    }

    let preview_url = Url::parse(&drive::view_to_preview_url(&recording.drive_url))?;
    state.drive.probe_preview(&preview_url).await?;

    let refreshed = state.drive.get_metadata(&file_id).await?;
    debug!(
        file_id,
        has_thumbnail = refreshed.has_thumbnail,
        ready = refreshed.is_video_ready(),
        "Preview state after the nudge"
    );

    state
        .db
        .record_wakeup_attempt(&recording.id, (recording.wakeup_attempts + 1).min(MAX_WAKEUP_ATTEMPTS))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn next_run_is_today_when_the_hour_is_ahead() {
        let now = datetime!(2025-08-18 00:30:00 UTC);
        assert_eq!(next_run_after(now, 2), datetime!(2025-08-18 02:00:00 UTC));
    }

    #[test]
    fn next_run_rolls_to_tomorrow_when_the_hour_passed() {
        let now = datetime!(2025-08-18 02:00:00 UTC);
        assert_eq!(next_run_after(now, 2), datetime!(2025-08-19 02:00:00 UTC));

        let later = datetime!(2025-08-18 14:00:00 UTC);
        assert_eq!(next_run_after(later, 2), datetime!(2025-08-19 02:00:00 UTC));
    }

    #[test]
    fn window_covers_the_previous_calendar_day() {
        let now = datetime!(2025-08-18 02:00:00 UTC);
        let (start, end) = previous_day_window(now);

        assert_eq!(start, datetime!(2025-08-17 00:00:00 UTC));
        assert_eq!(end, datetime!(2025-08-18 00:00:00 UTC));
    }
}
