use anyhow::Context as _;
use camino::Utf8Path;
use libsql::Connection;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use uuid::Uuid;

/// Linear migrations; the `user_version` pragma tracks how many have been
/// applied. Append only; adding a nullable column is always safe.
const MIGRATIONS: &[&str] = &[
    "
    CREATE TABLE meetings (
        id TEXT PRIMARY KEY,
        zoom_meeting_id TEXT UNIQUE,
        topic TEXT NOT NULL,
        course_id INTEGER,
        status TEXT NOT NULL DEFAULT 'scheduled',
        start_time TEXT,
        join_url TEXT,
        start_url TEXT,
        license_id TEXT
    );

    CREATE TABLE recordings (
        id TEXT PRIMARY KEY,
        meeting_id TEXT NOT NULL,
        zoom_recording_id TEXT NOT NULL UNIQUE,
        drive_url TEXT NOT NULL,
        created_at TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_retry_at TEXT
    );

    CREATE INDEX idx_recordings_meeting_id ON recordings (meeting_id);
    CREATE INDEX idx_recordings_created_at ON recordings (created_at);

    CREATE TABLE licenses (
        id TEXT PRIMARY KEY,
        account_email TEXT,
        meeting_id TEXT,
        in_use INTEGER NOT NULL DEFAULT 0
    );
    ",
    "
    ALTER TABLE recordings ADD COLUMN wakeup_attempts INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE recordings ADD COLUMN last_wakeup_at TEXT;
    ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingStatus {
    Scheduled,
    Completed,
}

impl MeetingStatus {
    fn as_str(self) -> &'static str {
        match self {
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::Completed => "completed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "completed" => MeetingStatus::Completed,
            _ => MeetingStatus::Scheduled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeetingRow {
    pub id: String,
    pub zoom_meeting_id: Option<String>,
    pub topic: String,
    pub course_id: Option<i64>,
    pub status: MeetingStatus,
    pub start_time: Option<OffsetDateTime>,
    pub join_url: Option<String>,
    pub start_url: Option<String>,
    pub license_id: Option<String>,
}

impl MeetingRow {
    /// Meeting synthesized from a webhook for an unknown external id.
    pub fn synthesized(
        zoom_meeting_id: &str,
        topic: &str,
        course_id: i64,
        start_time: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            zoom_meeting_id: Some(zoom_meeting_id.to_owned()),
            topic: topic.to_owned(),
            course_id: Some(course_id),
            status: MeetingStatus::Scheduled,
            start_time,
            join_url: None,
            start_url: None,
            license_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingRow {
    pub id: String,
    pub meeting_id: String,
    pub zoom_recording_id: String,
    pub drive_url: String,
    pub created_at: OffsetDateTime,
    pub retry_count: i64,
    pub last_retry_at: Option<OffsetDateTime>,
    pub wakeup_attempts: i64,
    pub last_wakeup_at: Option<OffsetDateTime>,
}

impl RecordingRow {
    pub fn new(meeting_id: &str, zoom_recording_id: &str, drive_url: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            meeting_id: meeting_id.to_owned(),
            zoom_recording_id: zoom_recording_id.to_owned(),
            drive_url: drive_url.to_owned(),
            created_at: OffsetDateTime::now_utc(),
            retry_count: 0,
            last_retry_at: None,
            wakeup_attempts: 0,
            last_wakeup_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingMeeting {
    pub meeting: MeetingRow,
    pub recording_count: i64,
}

#[derive(Clone)]
pub struct Db {
    conn: Connection,
}

impl Db {
    pub async fn open(path: &Utf8Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("couldn't create directory {parent}"))?;
        }

        let database = libsql::Builder::new_local(path.as_std_path())
            .build()
            .await
            .context("build database")?;

        let conn = database.connect().context("open database connection")?;

        Ok(Self { conn })
    }

    /// Applies pragmas and pending migrations. Call once per process.
    pub async fn setup(&self) -> anyhow::Result<()> {
        const PRAGMAS: &str = "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 15000;
        ";

        let mut batch_rows = self
            .conn
            .execute_batch(PRAGMAS)
            .await
            .context("failed to apply pragmas")?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else { continue };
            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        self.migrate().await
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let user_version = self.query_user_version().await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    self.conn
                        .execute_batch(sql_query)
                        .await
                        .with_context(|| format!("failed to execute migration {migration_id}"))?;

                    self.update_user_version(migration_id + 1)
                        .await
                        .context("failed to update user version")?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }

    async fn query_user_version(&self) -> anyhow::Result<usize> {
        let row = self
            .conn
            .query("PRAGMA user_version", ())
            .await
            .context("failed to execute SQL query")?
            .next()
            .await
            .context("failed to read the row")?
            .context("no row returned")?;

        let value = row.get::<u64>(0).context("failed to read user_version value")?;

        Ok(usize::try_from(value).context("user_version out of range")?)
    }

    async fn update_user_version(&self, value: usize) -> anyhow::Result<()> {
        let value = u64::try_from(value).context("user_version out of range")?;

        self.conn
            .execute(&format!("PRAGMA user_version = {value}"), ())
            .await
            .context("failed to execute SQL query")?;

        Ok(())
    }

    // == Meetings == //

    pub async fn find_meeting_by_zoom_id(&self, zoom_meeting_id: &str) -> anyhow::Result<Option<MeetingRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, zoom_meeting_id, topic, course_id, status, start_time, join_url, start_url, license_id
                 FROM meetings WHERE zoom_meeting_id = :zoom_meeting_id",
                [(":zoom_meeting_id", zoom_meeting_id)],
            )
            .await
            .context("meeting lookup failed")?;

        rows.next()
            .await
            .context("failed to read the meeting row")?
            .map(|row| meeting_from_row(&row))
            .transpose()
    }

    pub async fn find_meeting_by_id(&self, id: &str) -> anyhow::Result<Option<MeetingRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, zoom_meeting_id, topic, course_id, status, start_time, join_url, start_url, license_id
                 FROM meetings WHERE id = :id",
                [(":id", id)],
            )
            .await
            .context("meeting lookup failed")?;

        rows.next()
            .await
            .context("failed to read the meeting row")?
            .map(|row| meeting_from_row(&row))
            .transpose()
    }

    pub async fn insert_meeting(&self, meeting: &MeetingRow) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO meetings (id, zoom_meeting_id, topic, course_id, status, start_time, join_url, start_url, license_id)
                 VALUES (:id, :zoom_meeting_id, :topic, :course_id, :status, :start_time, :join_url, :start_url, :license_id)",
                (
                    (":id", meeting.id.as_str()),
                    (":zoom_meeting_id", opt_text(meeting.zoom_meeting_id.as_deref())),
                    (":topic", meeting.topic.as_str()),
                    (":course_id", opt_int(meeting.course_id)),
                    (":status", meeting.status.as_str()),
                    (":start_time", opt_time(meeting.start_time)),
                    (":join_url", opt_text(meeting.join_url.as_deref())),
                    (":start_url", opt_text(meeting.start_url.as_deref())),
                    (":license_id", opt_text(meeting.license_id.as_deref())),
                ),
            )
            .await
            .context("meeting insert failed")?;

        Ok(())
    }

    pub async fn set_meeting_completed(&self, id: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE meetings SET status = 'completed' WHERE id = :id",
                [(":id", id)],
            )
            .await
            .context("meeting status update failed")?;

        Ok(())
    }

    pub async fn set_meeting_course(&self, id: &str, course_id: i64) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE meetings SET course_id = :course_id WHERE id = :id",
                ((":id", id), (":course_id", course_id)),
            )
            .await
            .context("meeting course update failed")?;

        Ok(())
    }

    pub async fn pending_meetings(&self, only_without_artifact: bool, limit: u32) -> anyhow::Result<Vec<PendingMeeting>> {
        let mut rows = self
            .conn
            .query(
                "SELECT m.id, m.zoom_meeting_id, m.topic, m.course_id, m.status, m.start_time,
                        m.join_url, m.start_url, m.license_id,
                        (SELECT COUNT(*) FROM recordings r WHERE r.meeting_id = m.id) AS recording_count
                 FROM meetings m
                 WHERE :only_without_artifact = 0
                    OR NOT EXISTS (SELECT 1 FROM recordings r WHERE r.meeting_id = m.id)
                 ORDER BY m.start_time DESC
                 LIMIT :limit",
                (
                    (":only_without_artifact", i64::from(only_without_artifact)),
                    (":limit", i64::from(limit)),
                ),
            )
            .await
            .context("pending listing failed")?;

        let mut pending = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read a pending row")? {
            pending.push(PendingMeeting {
                meeting: meeting_from_row(&row)?,
                recording_count: row.get::<i64>(9).context("recording_count column")?,
            });
        }

        Ok(pending)
    }

    // == Recordings == //

    pub async fn find_recording_by_zoom_recording_id(
        &self,
        zoom_recording_id: &str,
    ) -> anyhow::Result<Option<RecordingRow>> {
        let mut rows = self
            .conn
            .query(
                &format!("{RECORDING_SELECT} WHERE zoom_recording_id = :zoom_recording_id"),
                [(":zoom_recording_id", zoom_recording_id)],
            )
            .await
            .context("recording lookup failed")?;

        rows.next()
            .await
            .context("failed to read the recording row")?
            .map(|row| recording_from_row(&row))
            .transpose()
    }

    pub async fn find_recordings_by_meeting(&self, meeting_id: &str) -> anyhow::Result<Vec<RecordingRow>> {
        let mut rows = self
            .conn
            .query(
                &format!("{RECORDING_SELECT} WHERE meeting_id = :meeting_id ORDER BY created_at DESC"),
                [(":meeting_id", meeting_id)],
            )
            .await
            .context("recording lookup failed")?;

        let mut recordings = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read a recording row")? {
            recordings.push(recording_from_row(&row)?);
        }

        Ok(recordings)
    }

    pub async fn recordings_created_between(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: u32,
    ) -> anyhow::Result<Vec<RecordingRow>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{RECORDING_SELECT} WHERE created_at >= :from AND created_at <= :to
                     ORDER BY created_at ASC LIMIT :limit"
                ),
                (
                    (":from", format_time(from)?),
                    (":to", format_time(to)?),
                    (":limit", i64::from(limit)),
                ),
            )
            .await
            .context("recording range lookup failed")?;

        let mut recordings = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read a recording row")? {
            recordings.push(recording_from_row(&row)?);
        }

        Ok(recordings)
    }

    pub async fn insert_recording(&self, recording: &RecordingRow) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO recordings (id, meeting_id, zoom_recording_id, drive_url, created_at,
                                         retry_count, last_retry_at, wakeup_attempts, last_wakeup_at)
                 VALUES (:id, :meeting_id, :zoom_recording_id, :drive_url, :created_at,
                         :retry_count, :last_retry_at, :wakeup_attempts, :last_wakeup_at)",
                (
                    (":id", recording.id.as_str()),
                    (":meeting_id", recording.meeting_id.as_str()),
                    (":zoom_recording_id", recording.zoom_recording_id.as_str()),
                    (":drive_url", recording.drive_url.as_str()),
                    (":created_at", format_time(recording.created_at)?),
                    (":retry_count", recording.retry_count),
                    (":last_retry_at", opt_time(recording.last_retry_at)),
                    (":wakeup_attempts", recording.wakeup_attempts),
                    (":last_wakeup_at", opt_time(recording.last_wakeup_at)),
                ),
            )
            .await
            .context("recording insert failed")?;

        Ok(())
    }

    /// Bumps the manual-republish counter.
    pub async fn increment_retry_count(&self, id: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE recordings SET retry_count = retry_count + 1, last_retry_at = :now WHERE id = :id",
                ((":id", id), (":now", format_time(OffsetDateTime::now_utc())?)),
            )
            .await
            .context("retry counter update failed")?;

        Ok(())
    }

    /// Recordings eligible for the preview wakeup pass.
    pub async fn wakeup_candidates(
        &self,
        window_start: OffsetDateTime,
        window_end: OffsetDateTime,
        cooldown_cutoff: OffsetDateTime,
    ) -> anyhow::Result<Vec<RecordingRow>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{RECORDING_SELECT}
                     WHERE created_at >= :window_start AND created_at < :window_end
                       AND drive_url != ''
                       AND wakeup_attempts < 2
                       AND (last_wakeup_at IS NULL OR last_wakeup_at <= :cooldown_cutoff)"
                ),
                (
                    (":window_start", format_time(window_start)?),
                    (":window_end", format_time(window_end)?),
                    (":cooldown_cutoff", format_time(cooldown_cutoff)?),
                ),
            )
            .await
            .context("wakeup candidate lookup failed")?;

        let mut recordings = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read a recording row")? {
            recordings.push(recording_from_row(&row)?);
        }

        Ok(recordings)
    }

    pub async fn record_wakeup_attempt(&self, id: &str, attempts: i64) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE recordings SET wakeup_attempts = :attempts, last_wakeup_at = :now WHERE id = :id",
                (
                    (":id", id),
                    (":attempts", attempts),
                    (":now", format_time(OffsetDateTime::now_utc())?),
                ),
            )
            .await
            .context("wakeup bookkeeping update failed")?;

        Ok(())
    }

    // == Licenses == //

    /// Frees the license slot bound to a meeting.
    ///
    /// Meetings synthesized from webhooks have no license row; that is a
    /// no-op, not an error.
    pub async fn release_license(&self, meeting_id: &str) -> anyhow::Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE licenses SET meeting_id = NULL, in_use = 0 WHERE meeting_id = :meeting_id",
                [(":meeting_id", meeting_id)],
            )
            .await
            .context("license release failed")?;

        Ok(changed > 0)
    }
}

const RECORDING_SELECT: &str = "SELECT id, meeting_id, zoom_recording_id, drive_url, created_at,
        retry_count, last_retry_at, wakeup_attempts, last_wakeup_at FROM recordings";

fn meeting_from_row(row: &libsql::Row) -> anyhow::Result<MeetingRow> {
    Ok(MeetingRow {
        id: row.get::<String>(0).context("id column")?,
        zoom_meeting_id: row.get::<Option<String>>(1).context("zoom_meeting_id column")?,
        topic: row.get::<String>(2).context("topic column")?,
        course_id: row.get::<Option<i64>>(3).context("course_id column")?,
        status: MeetingStatus::parse(&row.get::<String>(4).context("status column")?),
        start_time: parse_opt_time(row.get::<Option<String>>(5).context("start_time column")?)?,
        join_url: row.get::<Option<String>>(6).context("join_url column")?,
        start_url: row.get::<Option<String>>(7).context("start_url column")?,
        license_id: row.get::<Option<String>>(8).context("license_id column")?,
    })
}

fn recording_from_row(row: &libsql::Row) -> anyhow::Result<RecordingRow> {
    Ok(RecordingRow {
        id: row.get::<String>(0).context("id column")?,
        meeting_id: row.get::<String>(1).context("meeting_id column")?,
        zoom_recording_id: row.get::<String>(2).context("zoom_recording_id column")?,
        drive_url: row.get::<String>(3).context("drive_url column")?,
        created_at: parse_time(&row.get::<String>(4).context("created_at column")?)?,
        retry_count: row.get::<i64>(5).context("retry_count column")?,
        last_retry_at: parse_opt_time(row.get::<Option<String>>(6).context("last_retry_at column")?)?,
        wakeup_attempts: row.get::<i64>(7).context("wakeup_attempts column")?,
        last_wakeup_at: parse_opt_time(row.get::<Option<String>>(8).context("last_wakeup_at column")?)?,
    })
}

/// Timestamps are stored as RFC 3339 in UTC so that lexicographic SQL
/// comparisons match chronological order.
fn format_time(value: OffsetDateTime) -> anyhow::Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("couldn't format timestamp")
}

fn parse_time(value: &str) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).with_context(|| format!("invalid stored timestamp: {value}"))
}

fn parse_opt_time(value: Option<String>) -> anyhow::Result<Option<OffsetDateTime>> {
    value.as_deref().map(parse_time).transpose()
}

fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(text) => libsql::Value::Text(text.to_owned()),
        None => libsql::Value::Null,
    }
}

fn opt_int(value: Option<i64>) -> libsql::Value {
    match value {
        Some(int) => libsql::Value::Integer(int),
        None => libsql::Value::Null,
    }
}

fn opt_time(value: Option<OffsetDateTime>) -> libsql::Value {
    match value.map(format_time).transpose() {
        Ok(Some(text)) => libsql::Value::Text(text),
        _ => libsql::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8Path::from_path(dir.path()).expect("utf8 tempdir").join("test.db");
        let db = Db::open(&path).await.expect("open");
        db.setup().await.expect("setup");
        (dir, db)
    }

    #[tokio::test]
    async fn meetings_roundtrip_and_complete() {
        let (_dir, db) = open_temp_db().await;

        let meeting = MeetingRow::synthesized("94881330838", "Matemáticas Básicas", 13, None);
        db.insert_meeting(&meeting).await.expect("insert");

        let loaded = db
            .find_meeting_by_zoom_id("94881330838")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(loaded.topic, "Matemáticas Básicas");
        assert_eq!(loaded.course_id, Some(13));
        assert_eq!(loaded.status, MeetingStatus::Scheduled);

        db.set_meeting_completed(&loaded.id).await.expect("complete");

        let completed = db
            .find_meeting_by_id(&loaded.id)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(completed.status, MeetingStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_recording_ids_are_rejected() {
        let (_dir, db) = open_temp_db().await;

        let meeting = MeetingRow::synthesized("m1", "Topic", 13, None);
        db.insert_meeting(&meeting).await.expect("insert meeting");

        let recording = RecordingRow::new(&meeting.id, "abc123", "https://drive.google.com/file/d/x/view");
        db.insert_recording(&recording).await.expect("insert recording");

        let duplicate = RecordingRow::new(&meeting.id, "abc123", "https://drive.google.com/file/d/y/view");
        assert!(db.insert_recording(&duplicate).await.is_err());
    }

    #[tokio::test]
    async fn wakeup_candidates_respect_attempt_and_cooldown_bounds() {
        let (_dir, db) = open_temp_db().await;

        let meeting = MeetingRow::synthesized("m1", "Topic", 13, None);
        db.insert_meeting(&meeting).await.expect("insert meeting");

        let mut fresh = RecordingRow::new(&meeting.id, "rec-fresh", "https://drive.google.com/file/d/a/view");
        fresh.created_at = OffsetDateTime::now_utc() - time::Duration::hours(12);
        db.insert_recording(&fresh).await.expect("insert");

        let mut exhausted = RecordingRow::new(&meeting.id, "rec-exhausted", "https://drive.google.com/file/d/b/view");
        exhausted.created_at = OffsetDateTime::now_utc() - time::Duration::hours(12);
        exhausted.wakeup_attempts = 2;
        db.insert_recording(&exhausted).await.expect("insert");

        let now = OffsetDateTime::now_utc();
        let candidates = db
            .wakeup_candidates(now - time::Duration::days(1), now, now - time::Duration::minutes(90))
            .await
            .expect("candidates");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].zoom_recording_id, "rec-fresh");

        db.record_wakeup_attempt(&candidates[0].id, 1).await.expect("bookkeeping");

        // Just-poked recordings are inside the cooldown window.
        let candidates = db
            .wakeup_candidates(now - time::Duration::days(1), now, now - time::Duration::minutes(90))
            .await
            .expect("candidates");
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn license_release_tolerates_missing_rows() {
        let (_dir, db) = open_temp_db().await;

        let released = db.release_license("no-such-meeting").await.expect("release");
        assert!(!released);
    }
}
