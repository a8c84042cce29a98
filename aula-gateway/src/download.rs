use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8Path;
use futures::StreamExt as _;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt as _;
use url::Url;

use crate::config::TransferConf;
use crate::transfer::{retry_with_policy, RetryPolicy, TransferError};
use crate::zoom::ZoomClient;

/// Pause before re-probing a HEAD that says the artifact is still cooking.
const NOT_READY_PAUSE: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct DownloadedFile {
    pub content_type: Option<String>,
    pub content_length: u64,
}

/// Downloads a recording to `dest` with range-based resume.
///
/// The single-use `download_token` (query parameter) is preferred on the first
/// attempt; later attempts switch to a refreshed bearer token. Partial files
/// left by previous attempts are resumed, not restarted.
#[instrument(skip_all, fields(dest = %dest))]
pub async fn download_recording(
    zoom: &ZoomClient,
    url: &Url,
    dest: &Utf8Path,
    download_token: Option<&str>,
    expected_bytes: Option<u64>,
    transfers: &TransferConf,
) -> Result<DownloadedFile, TransferError> {
    let policy = RetryPolicy::download(transfers);

    retry_with_policy(&policy, |attempt| async move {
        let auth = resolve_auth(zoom, download_token, attempt).await?;

        warmup(zoom, url, &auth, transfers).await?;

        let downloaded = transfer_body(zoom, url, dest, &auth, expected_bytes, transfers).await?;

        if let Err(error) = validate(dest, &downloaded, expected_bytes, transfers).await {
            // A broken partial must not poison the next attempt.
            let _ = tokio::fs::remove_file(dest).await;
            return Err(error);
        }

        Ok(downloaded)
    })
    .await
}

enum AttemptAuth {
    /// Single-use token handed over by the webhook, passed as a query parameter.
    Query(String),
    Bearer(String),
}

impl AttemptAuth {
    fn request(&self, client: &reqwest::Client, method: reqwest::Method, url: &Url) -> reqwest::RequestBuilder {
        match self {
            AttemptAuth::Query(token) => {
                let mut url = url.clone();
                url.query_pairs_mut().append_pair("access_token", token);
                client.request(method, url)
            }
            AttemptAuth::Bearer(token) => client.request(method, url.clone()).bearer_auth(token),
        }
    }
}

async fn resolve_auth(
    zoom: &ZoomClient,
    download_token: Option<&str>,
    attempt: u32,
) -> Result<AttemptAuth, TransferError> {
    match download_token {
        Some(token) if attempt == 0 => Ok(AttemptAuth::Query(token.to_owned())),
        _ => {
            let token = zoom.access_token().await.map_err(TransferError::Transport)?;
            Ok(AttemptAuth::Bearer(token))
        }
    }
}

fn head_request(zoom: &ZoomClient, url: &Url, auth: &AttemptAuth, transfers: &TransferConf) -> reqwest::RequestBuilder {
    let mut request = auth.request(zoom.http_client(), reqwest::Method::HEAD, url);

    if let Some(timeout) = transfers.download_timeout {
        request = request.timeout(timeout);
    }

    request
}

/// HEAD probe before the body transfer. The provider serves a small HTML
/// placeholder while it is still assembling the MP4; a reported size below the
/// configured floor means "try again later", not "download this".
async fn warmup(
    zoom: &ZoomClient,
    url: &Url,
    auth: &AttemptAuth,
    transfers: &TransferConf,
) -> Result<(), TransferError> {
    const NOT_READY_STATUSES: [StatusCode; 3] = [
        StatusCode::NOT_FOUND,
        StatusCode::CONFLICT,
        StatusCode::TOO_EARLY,
    ];

    let mut response = head_request(zoom, url, auth, transfers)
        .send()
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;

    if NOT_READY_STATUSES.contains(&response.status()) {
        debug!(status = %response.status(), "HEAD says not ready, pausing before a second probe");
        tokio::time::sleep(NOT_READY_PAUSE).await;

        response = head_request(zoom, url, auth, transfers)
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.into()))?;

        if NOT_READY_STATUSES.contains(&response.status()) {
            return Err(TransferError::NotReady {
                reason: format!("HEAD returned {} twice", response.status()),
            });
        }
    }

    let head_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    if let Some(length) = head_length {
        if length < transfers.min_expected_size {
            return Err(TransferError::NotReady {
                reason: format!(
                    "HEAD reports {length} bytes, below the {} floor",
                    transfers.min_expected_size
                ),
            });
        }
    }

    Ok(())
}

async fn local_size(path: &Utf8Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(_) => 0,
    }
}

async fn transfer_body(
    zoom: &ZoomClient,
    url: &Url,
    dest: &Utf8Path,
    auth: &AttemptAuth,
    expected_bytes: Option<u64>,
    transfers: &TransferConf,
) -> Result<DownloadedFile, TransferError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("couldn't create the downloads directory")
            .map_err(TransferError::Transport)?;
    }

    let resume_from = local_size(dest).await;

    let mut request = auth.request(zoom.http_client(), reqwest::Method::GET, url);

    if let Some(timeout) = transfers.download_timeout {
        request = request.timeout(timeout);
    }

    if resume_from > 0 {
        request = request.header(RANGE, format!("bytes={resume_from}-"));
    }

    let response = request
        .send()
        .await
        .map_err(|e| TransferError::Transport(e.into()))?;

    let status = response.status();

    let append = match status {
        StatusCode::PARTIAL_CONTENT => true,
        StatusCode::OK => {
            if resume_from > 0 {
                debug!("Server ignored the range request, restarting from zero");
            }
            false
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            // Either we already have everything, or the partial is garbage.
            if expected_bytes.is_some_and(|expected| resume_from >= expected) {
                return Ok(DownloadedFile {
                    content_type: None,
                    content_length: resume_from,
                });
            }

            let _ = tokio::fs::remove_file(dest).await;
            return Err(TransferError::InvalidArtifact {
                reason: format!("416 with only {resume_from} local bytes"),
            });
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            // One forced refresh; the retry policy drives the next attempt.
            zoom.refresh_access_token()
                .await
                .map_err(TransferError::Transport)?;
            return Err(TransferError::Auth {
                status: status.as_u16(),
            });
        }
        StatusCode::TOO_MANY_REQUESTS => return Err(TransferError::RateLimited),
        _ => {
            return Err(TransferError::Transport(anyhow::anyhow!(
                "download request failed with status {status}"
            )));
        }
    };

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(dest.as_std_path())
        .await
        .context("couldn't open the destination file")
        .map_err(TransferError::Transport)?;

    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransferError::Transport(e.into()))?;
        file.write_all(&chunk)
            .await
            .context("couldn't write to the destination file")
            .map_err(TransferError::Transport)?;
    }

    file.flush()
        .await
        .context("couldn't flush the destination file")
        .map_err(TransferError::Transport)?;

    Ok(DownloadedFile {
        content_type,
        content_length: local_size(dest).await,
    })
}

async fn validate(
    dest: &Utf8Path,
    downloaded: &DownloadedFile,
    expected_bytes: Option<u64>,
    transfers: &TransferConf,
) -> Result<(), TransferError> {
    let size = local_size(dest).await;

    if size == 0 {
        return Err(TransferError::InvalidArtifact {
            reason: "downloaded file is empty".to_owned(),
        });
    }

    if size < transfers.min_expected_size {
        return Err(TransferError::InvalidArtifact {
            reason: format!("{size} bytes is below the {} floor", transfers.min_expected_size),
        });
    }

    if downloaded
        .content_type
        .as_deref()
        .is_some_and(|content_type| content_type.contains("text/html"))
    {
        return Err(TransferError::InvalidArtifact {
            reason: "server sent an HTML page instead of a video".to_owned(),
        });
    }

    if dest.extension() != Some("mp4") {
        return Err(TransferError::InvalidArtifact {
            reason: format!("unexpected destination extension: {dest}"),
        });
    }

    // The provider revises sizes while it finishes processing, so a mismatch
    // against its reported size is informational only.
    if let Some(expected) = expected_bytes {
        if size != expected {
            warn!(size, expected, "Downloaded size differs from the size reported upstream");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Conf, dto};

    fn transfers() -> TransferConf {
        let conf_file: dto::ConfFile = serde_json::from_str("{}").expect("empty conf");
        Conf::from_conf_file(&conf_file).expect("defaults").transfers
    }

    #[tokio::test]
    async fn validate_rejects_small_and_html_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = Utf8Path::from_path(dir.path())
            .expect("utf8 tempdir")
            .join("clip.mp4");

        tokio::fs::write(&dest, vec![0u8; 2 * 1024 * 1024]).await.expect("write");

        let ok = DownloadedFile {
            content_type: Some("video/mp4".to_owned()),
            content_length: 2 * 1024 * 1024,
        };
        assert!(validate(&dest, &ok, None, &transfers()).await.is_ok());

        let html = DownloadedFile {
            content_type: Some("text/html; charset=utf-8".to_owned()),
            content_length: 2 * 1024 * 1024,
        };
        assert!(matches!(
            validate(&dest, &html, None, &transfers()).await,
            Err(TransferError::InvalidArtifact { .. })
        ));

        tokio::fs::write(&dest, b"tiny").await.expect("write");
        let tiny = DownloadedFile {
            content_type: Some("video/mp4".to_owned()),
            content_length: 4,
        };
        assert!(matches!(
            validate(&dest, &tiny, None, &transfers()).await,
            Err(TransferError::InvalidArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn validate_treats_size_mismatch_as_warning_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = Utf8Path::from_path(dir.path())
            .expect("utf8 tempdir")
            .join("clip.mp4");

        tokio::fs::write(&dest, vec![0u8; 2 * 1024 * 1024]).await.expect("write");

        let downloaded = DownloadedFile {
            content_type: Some("video/mp4".to_owned()),
            content_length: 2 * 1024 * 1024,
        };

        // Expected 50 MiB upstream, got 2 MiB locally: still accepted.
        assert!(validate(&dest, &downloaded, Some(50 * 1024 * 1024), &transfers())
            .await
            .is_ok());
    }

    #[test]
    fn query_auth_appends_the_single_use_token() {
        let url = Url::parse("https://zoom.example.com/rec/download/abc").expect("valid url");
        let auth = AttemptAuth::Query("T".to_owned());

        let client = reqwest::Client::new();
        let request = auth
            .request(&client, reqwest::Method::GET, &url)
            .build()
            .expect("buildable request");

        assert_eq!(request.url().query(), Some("access_token=T"));
    }
}
