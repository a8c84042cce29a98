use std::cmp;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use time::{Date, OffsetDateTime};
use url::Url;

use crate::config::ZoomConf;

/// Refresh the cached OAuth token this long before its declared expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Client for the conferencing provider's REST API.
///
/// A single `reqwest::Client` is kept for connection pooling; the
/// account-credentials token is cached and refreshed lazily.
pub struct ZoomClient {
    client: reqwest::Client,
    conf: ZoomConf,
    token_cache: tokio::sync::Mutex<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeetingRecordings {
    #[serde(deserialize_with = "de_id_string")]
    pub id: String,
    pub topic: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub recording_files: Vec<RecordingFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingFile {
    pub id: String,
    pub file_type: Option<String>,
    pub file_size: Option<u64>,
    pub status: Option<String>,
    pub download_url: Option<String>,
    pub recording_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecordingsPage {
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub meetings: Vec<MeetingRecordings>,
}

impl ZoomClient {
    pub fn new(conf: ZoomConf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("couldn't build the provider HTTP client")?;

        Ok(Self {
            client,
            conf,
            token_cache: tokio::sync::Mutex::new(None),
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Returns a valid access token, refreshing it lazily when it is within
    /// the expiry margin.
    pub async fn access_token(&self) -> anyhow::Result<String> {
        let mut cache = self.token_cache.lock().await;

        if let Some(token) = cache.as_ref() {
            if token.expires_at - OffsetDateTime::now_utc() > TOKEN_EXPIRY_MARGIN {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *cache = Some(token);

        Ok(access_token)
    }

    /// Drops the cached token and fetches a fresh one (after a 401/403).
    pub async fn refresh_access_token(&self) -> anyhow::Result<String> {
        let mut cache = self.token_cache.lock().await;
        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *cache = Some(token);

        Ok(access_token)
    }

    async fn fetch_token(&self) -> anyhow::Result<CachedToken> {
        debug!("Requesting a provider access token");

        let response = self
            .client
            .post(self.conf.oauth_url.clone())
            .basic_auth(&self.conf.client_id, Some(&self.conf.client_secret))
            .form(&[
                ("grant_type", "account_credentials"),
                ("account_id", self.conf.account_id.as_str()),
            ])
            .send()
            .await
            .context("token request failed")?
            .error_for_status()
            .context("token endpoint returned an error")?;

        let token = response
            .json::<TokenResponse>()
            .await
            .context("couldn't parse the token response")?;

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: OffsetDateTime::now_utc() + Duration::from_secs(token.expires_in),
        })
    }

    fn api_url(&self, path: &str) -> anyhow::Result<Url> {
        self.conf
            .api_url
            .join(path)
            .with_context(|| format!("invalid API path: {path}"))
    }

    /// Fetches the recording files of a single meeting.
    pub async fn meeting_recordings(&self, meeting_id: &str) -> anyhow::Result<MeetingRecordings> {
        let token = self.access_token().await?;
        let url = self.api_url(&format!("meetings/{meeting_id}/recordings"))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("recordings lookup failed")?
            .error_for_status()
            .context("recordings lookup returned an error")?;

        response
            .json::<MeetingRecordings>()
            .await
            .context("couldn't parse the recordings response")
    }

    /// One page of the account-level recordings listing.
    pub async fn list_recordings(
        &self,
        from: Date,
        to: Date,
        next_page_token: Option<&str>,
    ) -> anyhow::Result<RecordingsPage> {
        let token = self.access_token().await?;
        let mut url = self.api_url(&format!("accounts/{}/recordings", self.conf.account_id))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("from", &from.to_string());
            pairs.append_pair("to", &to.to_string());
            pairs.append_pair("page_size", "30");
            if let Some(page_token) = next_page_token {
                pairs.append_pair("next_page_token", page_token);
            }
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("recordings listing failed")?
            .error_for_status()
            .context("recordings listing returned an error")?;

        response
            .json::<RecordingsPage>()
            .await
            .context("couldn't parse the recordings listing")
    }
}

/// Picks the best MP4 out of a meeting's recording files.
///
/// Only completed MP4 entries with a download URL qualify; views are ranked by
/// usefulness and ties go to the larger file.
pub fn select_mp4_file(files: &[RecordingFile]) -> Option<&RecordingFile> {
    const PREFERRED_VIEWS: [&str; 4] = [
        "shared_screen_with_speaker_view",
        "active_speaker",
        "speaker_view",
        "gallery_view",
    ];

    fn view_rank(file: &RecordingFile) -> usize {
        file.recording_type
            .as_deref()
            .and_then(|view| PREFERRED_VIEWS.iter().position(|candidate| *candidate == view))
            .unwrap_or(PREFERRED_VIEWS.len())
    }

    files
        .iter()
        .filter(|file| {
            file.file_type.as_deref() == Some("MP4")
                && file.download_url.is_some()
                && file.status.as_deref() == Some("completed")
        })
        .min_by_key(|file| (view_rank(file), cmp::Reverse(file.file_size.unwrap_or(0))))
}

/// The provider sends meeting ids as numbers in some payloads and strings in
/// others; normalize to a string either way.
fn de_id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Num(u64),
        Str(String),
    }

    Ok(match IdRepr::deserialize(deserializer)? {
        IdRepr::Num(id) => id.to_string(),
        IdRepr::Str(id) => id,
    })
}

pub mod webhook {
    use hmac::{Hmac, Mac as _};
    use serde::Deserialize;
    use sha2::Sha256;

    use super::MeetingRecordings;

    type HmacSha256 = Hmac<Sha256>;

    pub const RECORDING_COMPLETED: &str = "recording.completed";
    pub const URL_VALIDATION: &str = "endpoint.url_validation";

    pub const SIGNATURE_HEADER: &str = "x-signature";
    pub const TIMESTAMP_HEADER: &str = "x-timestamp";

    #[derive(Debug, Deserialize)]
    pub struct WebhookEnvelope {
        pub event: String,
        #[serde(default)]
        pub payload: serde_json::Value,
        pub download_token: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct UrlValidationPayload {
        #[serde(rename = "plainToken")]
        pub plain_token: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct RecordingCompletedPayload {
        pub object: MeetingRecordings,
    }

    fn mac_with_secret(secret: &str) -> HmacSha256 {
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length")
    }

    /// `"v0=" + hex(HMAC-SHA256(secret, "v0:" + timestamp + ":" + body))`
    pub fn compute_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = mac_with_secret(secret);
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time verification of the webhook signature.
    ///
    /// The provided value is hex-decoded and checked through `Mac::verify_slice`
    /// so a byte-wise short-circuit comparison never happens.
    pub fn verify_signature(secret: &str, timestamp: &str, signature: &str, body: &[u8]) -> bool {
        let Some(hex_digest) = signature.strip_prefix("v0=") else {
            return false;
        };

        let Ok(provided) = hex::decode(hex_digest) else {
            return false;
        };

        let mut mac = mac_with_secret(secret);
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        mac.verify_slice(&provided).is_ok()
    }

    /// Response token for the URL-validation handshake.
    pub fn encrypt_token(secret: &str, plain_token: &str) -> String {
        let mut mac = mac_with_secret(secret);
        mac.update(plain_token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp4(id: &str, view: &str, size: u64) -> RecordingFile {
        RecordingFile {
            id: id.to_owned(),
            file_type: Some("MP4".to_owned()),
            file_size: Some(size),
            status: Some("completed".to_owned()),
            download_url: Some(format!("https://zoom.example.com/rec/{id}")),
            recording_type: Some(view.to_owned()),
        }
    }

    #[test]
    fn mp4_selection_prefers_speaker_views() {
        let files = vec![
            mp4("gallery", "gallery_view", 900),
            mp4("speaker", "shared_screen_with_speaker_view", 100),
        ];

        let selected = select_mp4_file(&files).expect("one candidate");
        assert_eq!(selected.id, "speaker");
    }

    #[test]
    fn mp4_selection_breaks_ties_by_size() {
        let files = vec![
            mp4("small", "active_speaker", 100),
            mp4("large", "active_speaker", 900),
        ];

        let selected = select_mp4_file(&files).expect("one candidate");
        assert_eq!(selected.id, "large");
    }

    #[test]
    fn mp4_selection_skips_unusable_entries() {
        let mut no_url = mp4("no-url", "active_speaker", 100);
        no_url.download_url = None;

        let mut processing = mp4("processing", "active_speaker", 100);
        processing.status = Some("processing".to_owned());

        let mut transcript = mp4("transcript", "active_speaker", 100);
        transcript.file_type = Some("TRANSCRIPT".to_owned());

        assert!(select_mp4_file(&[no_url, processing, transcript]).is_none());
    }

    #[test]
    fn meeting_id_accepts_numbers_and_strings() {
        let from_number: MeetingRecordings =
            serde_json::from_str(r#"{"id": 94881330838, "topic": "Matemáticas Básicas"}"#).expect("valid");
        let from_string: MeetingRecordings =
            serde_json::from_str(r#"{"id": "94881330838", "topic": "Matemáticas Básicas"}"#).expect("valid");

        assert_eq!(from_number.id, "94881330838");
        assert_eq!(from_string.id, from_number.id);
    }

    mod webhook {
        use super::super::webhook;

        #[test]
        fn signature_roundtrip() {
            let body = br#"{"event":"recording.completed"}"#;
            let signature = webhook::compute_signature("s3cret", "1724000000", body);

            assert!(signature.starts_with("v0="));
            assert!(webhook::verify_signature("s3cret", "1724000000", &signature, body));
        }

        #[test]
        fn tampered_body_is_rejected() {
            let signature = webhook::compute_signature("s3cret", "1724000000", b"original");

            assert!(!webhook::verify_signature("s3cret", "1724000000", &signature, b"tampered"));
            assert!(!webhook::verify_signature("other", "1724000000", &signature, b"original"));
            assert!(!webhook::verify_signature("s3cret", "1724000001", &signature, b"original"));
        }

        #[test]
        fn malformed_signatures_are_rejected() {
            assert!(!webhook::verify_signature("s", "0", "missing-prefix", b""));
            assert!(!webhook::verify_signature("s", "0", "v0=not-hex!", b""));
            assert!(!webhook::verify_signature("s", "0", "v0=abcd", b""));
        }

        #[test]
        fn url_validation_token_is_hmac_hex() {
            // HMAC-SHA256("s", "abc"), independently computed.
            let token = webhook::encrypt_token("s", "abc");
            assert_eq!(token.len(), 64);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
