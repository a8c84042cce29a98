use anyhow::Context as _;
use camino::Utf8Path;
use md5::{Digest as _, Md5};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use url::Url;

use crate::config::TransferConf;
use crate::drive::{DriveClient, DriveFileMeta};
use crate::transfer::{RetryPolicy, TransferError};

/// Consecutive 308-without-Range responses tolerated before giving up.
const STUCK_308_LIMIT: u32 = 5;

/// Size tolerance between the local file and the stored object.
const SIZE_TOLERANCE: u64 = 1024;

/// App-level tags attached to the stored object; `external_recording_id` is
/// the idempotency key the store is queried by.
#[derive(Debug, Clone)]
pub struct UploadTags {
    pub meeting_id: String,
    pub course_id: i64,
    pub external_recording_id: String,
}

#[derive(Debug, Clone)]
pub struct VerifiedUpload {
    pub file_id: String,
    pub view_url: String,
    pub remote_md5: String,
    pub remote_size: u64,
}

#[derive(Default)]
struct UploadSession {
    url: Option<Url>,
    offset: u64,
    stuck_308: u32,
}

/// Uploads `local` through a resumable session and verifies the stored copy.
///
/// Retries resume the existing session where possible; an integrity failure
/// discards the session and starts over from byte zero.
#[instrument(skip_all, fields(name = %name))]
pub async fn upload_recording(
    drive: &DriveClient,
    local: &Utf8Path,
    name: &str,
    folder_id: &str,
    tags: &UploadTags,
    transfers: &TransferConf,
) -> Result<VerifiedUpload, TransferError> {
    let policy = RetryPolicy::upload(transfers);

    let total_size = tokio::fs::metadata(local.as_std_path())
        .await
        .context("couldn't stat the file to upload")
        .map_err(TransferError::fatal)?
        .len();

    let local_md5 = md5_of_file(local).await.map_err(TransferError::fatal)?;

    let mut session = UploadSession::default();
    let mut attempt = 0;

    loop {
        let result = match upload_attempt(drive, local, name, folder_id, tags, transfers, total_size, &mut session).await
        {
            Ok(meta) => verify_upload(drive, &meta.id, total_size, &local_md5).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(verified) => return Ok(verified),
            Err(error) if error.is_retriable() && attempt + 1 < policy.max_attempts => {
                if matches!(error, TransferError::IntegrityMismatch { .. }) {
                    // The stored bytes cannot be trusted; a fresh session is
                    // the only way to replace them.
                    session = UploadSession::default();
                }

                let delay = policy.delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = format!("{error:#}", error = anyhow::anyhow!(error)),
                    "Upload attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn upload_attempt(
    drive: &DriveClient,
    local: &Utf8Path,
    name: &str,
    folder_id: &str,
    tags: &UploadTags,
    transfers: &TransferConf,
    total_size: u64,
    session: &mut UploadSession,
) -> Result<DriveFileMeta, TransferError> {
    if session.url.is_none() {
        session.url = Some(initiate_session(drive, name, folder_id, tags).await?);
        session.offset = 0;
        session.stuck_308 = 0;
    }

    let session_url = session.url.clone().expect("session URL was just initialized");

    loop {
        if session.offset >= total_size {
            // The tail chunk got acknowledged with a 308; ask the server to
            // finalize and hand over the metadata.
            return query_session_status(drive, &session_url, total_size, transfers).await;
        }

        let first = session.offset;
        let last = (first + transfers.chunk_size).min(total_size) - 1;

        // A fresh reader for every PUT: re-sending a consumed stream would
        // silently upload zero bytes.
        let chunk = read_chunk(local, first, last).await.map_err(TransferError::fatal)?;

        let mut request = drive
            .http_client()
            .put(session_url.clone())
            .header(CONTENT_LENGTH, chunk.len())
            .header(CONTENT_RANGE, format!("bytes {first}-{last}/{total_size}"))
            .body(chunk);

        if let Some(timeout) = transfers.upload_timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.into()))?;

        match handle_put_response(response, session).await? {
            PutOutcome::Completed(meta) => return Ok(meta),
            PutOutcome::Continue => {}
        }
    }
}

enum PutOutcome {
    Completed(DriveFileMeta),
    Continue,
}

async fn handle_put_response(response: reqwest::Response, session: &mut UploadSession) -> Result<PutOutcome, TransferError> {
    let status = response.status();

    if status.is_success() {
        let meta = response
            .json::<DriveFileMeta>()
            .await
            .context("couldn't parse the finalized object metadata")
            .map_err(TransferError::Transport)?;
        return Ok(PutOutcome::Completed(meta));
    }

    if status == StatusCode::PERMANENT_REDIRECT {
        match parse_committed_end(response.headers().get(RANGE)) {
            Some(end) => {
                session.offset = end + 1;
                session.stuck_308 = 0;
            }
            None => {
                session.stuck_308 += 1;
                debug!(count = session.stuck_308, "308 without a Range header, re-sending the chunk");

                if session.stuck_308 >= STUCK_308_LIMIT {
                    return Err(TransferError::fatal(anyhow::anyhow!(
                        "stuck-308: {STUCK_308_LIMIT} consecutive 308 responses without progress"
                    )));
                }
            }
        }
        return Ok(PutOutcome::Continue);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TransferError::RateLimited);
    }

    if status.is_server_error() {
        return Err(TransferError::Transport(anyhow::anyhow!(
            "upload endpoint returned {status}"
        )));
    }

    Err(TransferError::fatal(anyhow::anyhow!("upload endpoint returned {status}")))
}

async fn initiate_session(
    drive: &DriveClient,
    name: &str,
    folder_id: &str,
    tags: &UploadTags,
) -> Result<Url, TransferError> {
    let metadata = serde_json::json!({
        "name": name,
        "parents": [folder_id],
        "appProperties": {
            "meetingId": tags.meeting_id,
            "courseId": tags.course_id.to_string(),
            "externalRecordingId": tags.external_recording_id,
        },
        "copyRequiresWriterPermission": true,
    });

    let response = drive
        .http_client()
        .post(drive.conf().upload_url.clone())
        .bearer_auth(&drive.conf().access_token)
        .query(&[("uploadType", "resumable")])
        .json(&metadata)
        .send()
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;

    let status = response.status();

    if !status.is_success() {
        return if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(TransferError::Transport(anyhow::anyhow!(
                "session initiation returned {status}"
            )))
        } else {
            Err(TransferError::fatal(anyhow::anyhow!("session initiation returned {status}")))
        };
    }

    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .context("missing Location header on the upload session")
        .map_err(TransferError::fatal)?;

    Url::parse(location)
        .context("invalid upload session URL")
        .map_err(TransferError::fatal)
}

/// `Content-Range: bytes */TOTAL` probe used once every byte is sent.
async fn query_session_status(
    drive: &DriveClient,
    session_url: &Url,
    total_size: u64,
    transfers: &TransferConf,
) -> Result<DriveFileMeta, TransferError> {
    let mut request = drive
        .http_client()
        .put(session_url.clone())
        .header(CONTENT_LENGTH, 0)
        .header(CONTENT_RANGE, format!("bytes */{total_size}"));

    if let Some(timeout) = transfers.upload_timeout {
        request = request.timeout(timeout);
    }

    let response = request
        .send()
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;

    if response.status().is_success() {
        response
            .json::<DriveFileMeta>()
            .await
            .context("couldn't parse the finalized object metadata")
            .map_err(TransferError::Transport)
    } else {
        Err(TransferError::Transport(anyhow::anyhow!(
            "session status probe returned {}",
            response.status()
        )))
    }
}

async fn verify_upload(
    drive: &DriveClient,
    file_id: &str,
    local_size: u64,
    local_md5: &str,
) -> Result<VerifiedUpload, TransferError> {
    let meta = drive
        .get_metadata(file_id)
        .await
        .map_err(TransferError::Transport)?;

    let Some(remote_md5) = meta.md5_checksum else {
        // The store computes the checksum as part of finalization; its absence
        // usually means the object never finished assembling.
        return Err(TransferError::IntegrityMismatch {
            reason: "remote MD5 is missing (probable incomplete upload)".to_owned(),
        });
    };

    if !remote_md5.eq_ignore_ascii_case(local_md5) {
        return Err(TransferError::IntegrityMismatch {
            reason: format!("MD5 mismatch: local {local_md5}, remote {remote_md5}"),
        });
    }

    let remote_size = meta.size.unwrap_or(0);

    if remote_size.abs_diff(local_size) > SIZE_TOLERANCE {
        return Err(TransferError::IntegrityMismatch {
            reason: format!("size mismatch: local {local_size}, remote {remote_size}"),
        });
    }

    let view_url = meta
        .web_view_link
        .unwrap_or_else(|| format!("https://drive.google.com/file/d/{file_id}/view"));

    Ok(VerifiedUpload {
        file_id: file_id.to_owned(),
        view_url,
        remote_md5,
        remote_size,
    })
}

/// Reads bytes `[first, last]` of `path` into a fresh buffer.
async fn read_chunk(path: &Utf8Path, first: u64, last: u64) -> anyhow::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path.as_std_path())
        .await
        .context("couldn't open the file to upload")?;

    file.seek(std::io::SeekFrom::Start(first))
        .await
        .context("couldn't seek to the chunk start")?;

    let len = usize::try_from(last - first + 1).context("chunk too large for this platform")?;
    let mut buffer = Vec::with_capacity(len);

    let read = file
        .take(len as u64)
        .read_to_end(&mut buffer)
        .await
        .context("couldn't read the chunk")?;

    anyhow::ensure!(read == len, "short read: wanted {len} bytes, got {read}");

    Ok(buffer)
}

/// MD5 of a local file, streamed in small blocks.
pub async fn md5_of_file(path: &Utf8Path) -> anyhow::Result<String> {
    let mut file = tokio::fs::File::open(path.as_std_path())
        .await
        .context("couldn't open the file to hash")?;

    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await.context("couldn't read the file to hash")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// `Range: bytes=0-K` → `K`; the store always commits from byte zero.
fn parse_committed_end(range: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let range = range?.to_str().ok()?;
    range.strip_prefix("bytes=0-")?.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_end_is_parsed_from_the_range_header() {
        let header = reqwest::header::HeaderValue::from_static("bytes=0-33554431");
        assert_eq!(parse_committed_end(Some(&header)), Some(33_554_431));

        let bogus = reqwest::header::HeaderValue::from_static("bytes=100-200");
        assert_eq!(parse_committed_end(Some(&bogus)), None);

        assert_eq!(parse_committed_end(None), None);
    }

    #[tokio::test]
    async fn md5_matches_a_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8Path::from_path(dir.path()).expect("utf8 tempdir").join("clip.bin");

        tokio::fs::write(&path, b"abc").await.expect("write");

        // md5("abc")
        assert_eq!(md5_of_file(&path).await.expect("hash"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn chunks_are_read_fresh_with_exact_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8Path::from_path(dir.path()).expect("utf8 tempdir").join("clip.bin");

        tokio::fs::write(&path, b"0123456789").await.expect("write");

        assert_eq!(read_chunk(&path, 0, 3).await.expect("chunk"), b"0123");
        assert_eq!(read_chunk(&path, 4, 9).await.expect("chunk"), b"456789");
        // Reading the same range twice yields the same bytes (no consumed-stream reuse).
        assert_eq!(read_chunk(&path, 4, 9).await.expect("chunk"), b"456789");
        assert!(read_chunk(&path, 8, 12).await.is_err());
    }
}
