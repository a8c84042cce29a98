use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Per-process guard structures shared by webhooks, manual retries and jobs.
///
/// All of this is process-local; a restart forgets every in-flight marker.
pub struct PipelineContext {
    in_flight_meetings: parking_lot::Mutex<HashSet<String>>,
    file_locks: parking_lot::Mutex<HashMap<Utf8PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    upload_semaphore: Arc<Semaphore>,
    retries_in_progress: parking_lot::Mutex<HashSet<String>>,
}

impl PipelineContext {
    pub fn new(upload_concurrency: usize) -> Self {
        Self {
            in_flight_meetings: parking_lot::Mutex::new(HashSet::new()),
            file_locks: parking_lot::Mutex::new(HashMap::new()),
            upload_semaphore: Arc::new(Semaphore::new(upload_concurrency)),
            retries_in_progress: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Marks an external meeting id as being processed.
    ///
    /// Returns `None` when a pipeline for the same id is already running, in
    /// which case the caller must answer `in-flight` without side effects.
    pub fn begin_meeting(self: &Arc<Self>, meeting_id: &str) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight_meetings.lock();

        if !in_flight.insert(meeting_id.to_owned()) {
            return None;
        }

        Some(InFlightGuard {
            ctx: Arc::clone(self),
            meeting_id: meeting_id.to_owned(),
        })
    }

    pub fn is_meeting_in_flight(&self, meeting_id: &str) -> bool {
        self.in_flight_meetings.lock().contains(meeting_id)
    }

    /// Serializes access to a local file path across download and upload phases.
    pub async fn lock_path(&self, path: &Utf8Path) -> OwnedMutexGuard<()> {
        let path_lock = {
            let mut locks = self.file_locks.lock();
            let entry = locks
                .entry(path.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
            Arc::clone(entry)
        };

        path_lock.lock_owned().await
    }

    /// Waits for one of the bounded upload slots.
    pub async fn acquire_upload_slot(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.upload_semaphore)
            .acquire_owned()
            .await
            .expect("upload semaphore is never closed")
    }

    /// Marks a manual-retry key as in progress.
    ///
    /// Returns `None` when another retry for the same target is still running.
    pub fn begin_retry(self: &Arc<Self>, key: &str) -> Option<RetryGuard> {
        let mut retries = self.retries_in_progress.lock();

        if !retries.insert(key.to_owned()) {
            return None;
        }

        Some(RetryGuard {
            ctx: Arc::clone(self),
            key: key.to_owned(),
        })
    }
}

/// Releases the in-flight marker when dropped, whatever the pipeline outcome.
#[must_use]
pub struct InFlightGuard {
    ctx: Arc<PipelineContext>,
    meeting_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ctx.in_flight_meetings.lock().remove(&self.meeting_id);
    }
}

#[must_use]
pub struct RetryGuard {
    ctx: Arc<PipelineContext>,
    key: String,
}

impl Drop for RetryGuard {
    fn drop(&mut self) {
        self.ctx.retries_in_progress.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_meeting_is_rejected_until_guard_drops() {
        let ctx = Arc::new(PipelineContext::new(3));

        let guard = ctx.begin_meeting("94881330838").expect("first entry");
        assert!(ctx.begin_meeting("94881330838").is_none());
        assert!(ctx.is_meeting_in_flight("94881330838"));

        drop(guard);

        assert!(!ctx.is_meeting_in_flight("94881330838"));
        assert!(ctx.begin_meeting("94881330838").is_some());
    }

    #[test]
    fn retry_guard_is_scoped_per_key() {
        let ctx = Arc::new(PipelineContext::new(3));

        let _guard = ctx.begin_retry("rec:abc123").expect("first retry");
        assert!(ctx.begin_retry("rec:abc123").is_none());
        assert!(ctx.begin_retry("rec:other").is_some());
    }

    #[tokio::test]
    async fn path_lock_serializes_access() {
        let ctx = Arc::new(PipelineContext::new(3));
        let path = Utf8PathBuf::from("downloads/video.mp4");

        let first = ctx.lock_path(&path).await;

        let ctx2 = Arc::clone(&ctx);
        let path2 = path.clone();
        let second = tokio::spawn(async move { ctx2.lock_path(&path2).await });

        // The second locker must not complete while the first guard is alive.
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        drop(first);
        second.await.expect("second locker completes");
    }

    #[tokio::test]
    async fn upload_slots_are_bounded() {
        let ctx = Arc::new(PipelineContext::new(1));

        let permit = ctx.acquire_upload_slot().await;

        let ctx2 = Arc::clone(&ctx);
        let waiting = tokio::spawn(async move { ctx2.acquire_upload_slot().await });

        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(permit);
        waiting.await.expect("slot becomes available");
    }
}
