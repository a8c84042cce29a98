use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use url::Url;

use crate::config::DriveConf;

pub mod upload;

pub use upload::{upload_recording, UploadTags, VerifiedUpload};

const FILE_FIELDS: &str = "id,name,md5Checksum,size,webViewLink,hasThumbnail,videoMediaMetadata";

/// Client for the object store's REST surface.
pub struct DriveClient {
    client: reqwest::Client,
    conf: DriveConf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFileMeta {
    pub id: String,
    pub name: Option<String>,
    pub md5_checksum: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u64_string")]
    pub size: Option<u64>,
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub has_thumbnail: bool,
    pub video_media_metadata: Option<VideoMediaMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMediaMetadata {
    pub processing_status: Option<String>,
}

impl DriveFileMeta {
    /// Whether the store finished post-processing the video (thumbnail etc.).
    pub fn is_video_ready(&self) -> bool {
        self.video_media_metadata
            .as_ref()
            .and_then(|video| video.processing_status.as_deref())
            .is_some_and(|status| status == "ready")
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFileMeta>,
}

impl DriveClient {
    pub fn new(conf: DriveConf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("couldn't build the object-store HTTP client")?;

        Ok(Self { client, conf })
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn conf(&self) -> &DriveConf {
        &self.conf
    }

    fn files_url(&self, path: &str) -> anyhow::Result<Url> {
        self.conf
            .api_url
            .join(path)
            .with_context(|| format!("invalid object-store path: {path}"))
    }

    pub async fn get_metadata(&self, file_id: &str) -> anyhow::Result<DriveFileMeta> {
        let url = self.files_url(&format!("files/{file_id}"))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.conf.access_token)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .context("metadata request failed")?
            .error_for_status()
            .context("metadata request returned an error")?;

        response.json::<DriveFileMeta>().await.context("couldn't parse metadata")
    }

    /// Looks up a stored artifact by its provider recording id tag.
    ///
    /// This is the idempotency probe: a hit means the artifact already exists
    /// and the caller must not upload again.
    pub async fn find_by_recording_id(&self, recording_id: &str) -> anyhow::Result<Option<DriveFileMeta>> {
        let url = self.files_url("files")?;

        let escaped = recording_id.replace('\'', "\\'");
        let query = format!(
            "appProperties has {{ key='externalRecordingId' and value='{escaped}' }} and trashed=false"
        );

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.conf.access_token)
            .query(&[
                ("q", query.as_str()),
                ("fields", &format!("files({FILE_FIELDS})")),
                ("pageSize", "1"),
            ])
            .send()
            .await
            .context("artifact lookup failed")?
            .error_for_status()
            .context("artifact lookup returned an error")?;

        let list = response.json::<FileList>().await.context("couldn't parse file list")?;

        Ok(list.files.into_iter().next())
    }

    /// Finds or creates a folder named `name` under `parent_id`.
    pub async fn ensure_folder(&self, parent_id: &str, name: &str) -> anyhow::Result<String> {
        let url = self.files_url("files")?;

        let escaped = name.replace('\'', "\\'");
        let query = format!(
            "name='{escaped}' and '{parent_id}' in parents \
             and mimeType='application/vnd.google-apps.folder' and trashed=false"
        );

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.conf.access_token)
            .query(&[("q", query.as_str()), ("fields", "files(id,name)"), ("pageSize", "1")])
            .send()
            .await
            .context("folder lookup failed")?
            .error_for_status()
            .context("folder lookup returned an error")?;

        let list = response.json::<FileList>().await.context("couldn't parse folder list")?;

        if let Some(folder) = list.files.into_iter().next() {
            return Ok(folder.id);
        }

        debug!(parent_id, name, "Creating a new folder");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.conf.access_token)
            .json(&serde_json::json!({
                "name": name,
                "mimeType": "application/vnd.google-apps.folder",
                "parents": [parent_id],
            }))
            .send()
            .await
            .context("folder creation failed")?
            .error_for_status()
            .context("folder creation returned an error")?;

        let folder = response.json::<DriveFileMeta>().await.context("couldn't parse new folder")?;

        Ok(folder.id)
    }

    /// Grants "anyone with the link" read access and forbids reader copies.
    ///
    /// Retried independently from the upload; a final failure is reported to
    /// the caller, which logs it and carries on.
    pub async fn grant_public_reader(&self, file_id: &str) -> anyhow::Result<()> {
        const MAX_ATTEMPTS: u32 = 5;
        const BASE_DELAY: Duration = Duration::from_secs(1);
        const MAX_DELAY: Duration = Duration::from_secs(30);

        let mut attempt = 0;

        loop {
            match self.try_grant_public_reader(file_id).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt + 1 < MAX_ATTEMPTS => {
                    let delay = BASE_DELAY.saturating_mul(1 << attempt.min(10)).min(MAX_DELAY);
                    warn!(
                        file_id,
                        attempt,
                        error = format!("{error:#}"),
                        "Permission grant failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_grant_public_reader(&self, file_id: &str) -> anyhow::Result<()> {
        let permissions_url = self.files_url(&format!("files/{file_id}/permissions"))?;

        self.client
            .post(permissions_url)
            .bearer_auth(&self.conf.access_token)
            .json(&serde_json::json!({ "role": "reader", "type": "anyone" }))
            .send()
            .await
            .context("permission request failed")?
            .error_for_status()
            .context("permission request returned an error")?;

        let file_url = self.files_url(&format!("files/{file_id}"))?;

        self.client
            .patch(file_url)
            .bearer_auth(&self.conf.access_token)
            .json(&serde_json::json!({ "copyRequiresWriterPermission": true }))
            .send()
            .await
            .context("copy-protection request failed")?
            .error_for_status()
            .context("copy-protection request returned an error")?;

        Ok(())
    }

    /// Passive probe nudging the store into generating the preview.
    pub async fn probe_preview(&self, preview_url: &Url) -> anyhow::Result<()> {
        self.client
            .head(preview_url.clone())
            .send()
            .await
            .context("preview probe failed")?;

        Ok(())
    }
}

/// Human viewing URL → embedded preview URL.
pub fn view_to_preview_url(view_url: &str) -> String {
    view_url.replace("/view", "/preview")
}

/// Extracts the artifact id out of a stored viewing URL.
///
/// Both URL shapes handed out by the store are recognized:
/// `…/file/d/<id>/view` and `…?id=<id>`.
pub fn extract_file_id(url: &str) -> Option<String> {
    static PATH_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    static QUERY_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let path_re = PATH_RE.get_or_init(|| regex::Regex::new(r"/file/d/([A-Za-z0-9_-]+)").expect("valid regex"));
    let query_re = QUERY_RE.get_or_init(|| regex::Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").expect("valid regex"));

    path_re
        .captures(url)
        .or_else(|| query_re.captures(url))
        .map(|captures| captures[1].to_owned())
}

fn de_opt_u64_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Num(u64),
        Str(String),
    }

    match Option::<SizeRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(SizeRepr::Num(size)) => Ok(Some(size)),
        Some(SizeRepr::Str(size)) => size.parse::<u64>().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_is_extracted_from_both_url_shapes() {
        assert_eq!(
            extract_file_id("https://drive.google.com/file/d/1AbC_d-9/view?usp=sharing").as_deref(),
            Some("1AbC_d-9")
        );
        assert_eq!(
            extract_file_id("https://drive.google.com/open?id=1AbC_d-9").as_deref(),
            Some("1AbC_d-9")
        );
        assert_eq!(extract_file_id("https://drive.google.com/drive/folders/xyz"), None);
    }

    #[test]
    fn preview_url_replaces_the_view_segment() {
        assert_eq!(
            view_to_preview_url("https://drive.google.com/file/d/1AbC/view"),
            "https://drive.google.com/file/d/1AbC/preview"
        );
    }

    #[test]
    fn metadata_size_accepts_string_and_number() {
        let json = r#"{"id": "f1", "size": "52428800", "md5Checksum": "aa"}"#;
        let meta: DriveFileMeta = serde_json::from_str(json).expect("valid");
        assert_eq!(meta.size, Some(52_428_800));

        let json = r#"{"id": "f1", "size": 1024}"#;
        let meta: DriveFileMeta = serde_json::from_str(json).expect("valid");
        assert_eq!(meta.size, Some(1024));
    }

    #[test]
    fn video_readiness_requires_the_ready_status() {
        let ready: DriveFileMeta =
            serde_json::from_str(r#"{"id": "f1", "videoMediaMetadata": {"processingStatus": "ready"}}"#)
                .expect("valid");
        let processing: DriveFileMeta =
            serde_json::from_str(r#"{"id": "f1", "videoMediaMetadata": {"processingStatus": "processing"}}"#)
                .expect("valid");
        let unknown: DriveFileMeta = serde_json::from_str(r#"{"id": "f1"}"#).expect("valid");

        assert!(ready.is_video_ready());
        assert!(!processing.is_video_ready());
        assert!(!unknown.is_video_ready());
    }
}
