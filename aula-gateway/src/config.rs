use std::env;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use tap::prelude::*;
use tokio::sync::Notify;
use url::Url;

const DEFAULT_CHUNK_SIZE_MB: u64 = 32;
const DEFAULT_MIN_EXPECTED_SIZE_MB: u64 = 1;
const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;
const DEFAULT_PREPUBLISH_DELAY_MS: u64 = 30_000;
const DEFAULT_COURSES_CACHE_MS: u64 = 300_000;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 30_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 300_000;
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_WAKEUP_HOUR: u8 = 2;

#[derive(Debug, Clone)]
pub struct Conf {
    pub listen_address: SocketAddr,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub database_path: Utf8PathBuf,
    pub downloads_dir: Utf8PathBuf,
    pub zoom: ZoomConf,
    pub drive: DriveConf,
    pub moodle: MoodleConf,
    pub transfers: TransferConf,
    pub wakeup_hour: u8,
}

#[derive(Debug, Clone)]
pub struct ZoomConf {
    pub api_url: Url,
    pub oauth_url: Url,
    pub account_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: Option<String>,
    pub webhook_disable_signature: bool,
}

#[derive(Debug, Clone)]
pub struct DriveConf {
    pub api_url: Url,
    pub upload_url: Url,
    pub access_token: String,
    pub root_folder_id: String,
}

#[derive(Debug, Clone)]
pub struct MoodleConf {
    pub base_url: Url,
    pub ws_token: String,
    pub default_course_id: Option<i64>,
    pub courses_cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct TransferConf {
    pub max_retries_download: u32,
    pub max_retries_upload: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` means unbounded (the default for long transfers).
    pub download_timeout: Option<Duration>,
    pub upload_timeout: Option<Duration>,
    pub chunk_size: u64,
    pub min_expected_size: u64,
    pub prepublish_delay: Duration,
    pub upload_concurrency: usize,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let listen_address = conf_file
            .listen_address
            .as_deref()
            .unwrap_or("0.0.0.0:8080")
            .parse::<SocketAddr>()
            .context("invalid listen address")?;

        let data_dir = get_data_dir();

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("gateway"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let database_path = conf_file
            .database_path
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("gateway.db"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let downloads_dir = conf_file
            .downloads_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("downloads"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let zoom_file = conf_file.zoom.clone().unwrap_or_default();

        let zoom = ZoomConf {
            api_url: parse_url_or(zoom_file.api_url.as_deref(), "https://api.zoom.us/v2/")?,
            oauth_url: parse_url_or(zoom_file.oauth_url.as_deref(), "https://zoom.us/oauth/token")?,
            account_id: zoom_file.account_id.unwrap_or_default(),
            client_id: zoom_file.client_id.unwrap_or_default(),
            client_secret: zoom_file.client_secret.unwrap_or_default(),
            webhook_secret: zoom_file.webhook_secret.filter(|secret| !secret.is_empty()),
            webhook_disable_signature: zoom_file.webhook_disable_signature.unwrap_or(false),
        };

        let drive_file = conf_file.drive.clone().unwrap_or_default();

        let drive = DriveConf {
            api_url: parse_url_or(drive_file.api_url.as_deref(), "https://www.googleapis.com/drive/v3/")?,
            upload_url: parse_url_or(
                drive_file.upload_url.as_deref(),
                "https://www.googleapis.com/upload/drive/v3/files",
            )?,
            access_token: drive_file.access_token.unwrap_or_default(),
            root_folder_id: drive_file.root_folder_id.unwrap_or_default(),
        };

        let moodle_file = conf_file.moodle.clone().unwrap_or_default();

        let moodle = MoodleConf {
            base_url: parse_url_or(moodle_file.base_url.as_deref(), "http://localhost/moodle/")?,
            ws_token: moodle_file.ws_token.unwrap_or_default(),
            default_course_id: moodle_file.default_course_id,
            courses_cache_ttl: Duration::from_millis(moodle_file.courses_cache_ms.unwrap_or(DEFAULT_COURSES_CACHE_MS)),
        };

        let transfers_file = conf_file.transfers.clone().unwrap_or_default();

        let transfers = TransferConf {
            max_retries_download: transfers_file.max_retries_download.unwrap_or(DEFAULT_MAX_RETRIES),
            max_retries_upload: transfers_file.max_retries_upload.unwrap_or(DEFAULT_MAX_RETRIES),
            initial_backoff: Duration::from_millis(
                transfers_file.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(transfers_file.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS)),
            download_timeout: timeout_from_millis(transfers_file.download_timeout_ms),
            upload_timeout: timeout_from_millis(transfers_file.upload_timeout_ms),
            chunk_size: transfers_file.chunk_size_mb.unwrap_or(DEFAULT_CHUNK_SIZE_MB) * 1024 * 1024,
            min_expected_size: transfers_file
                .min_expected_size_mb
                .unwrap_or(DEFAULT_MIN_EXPECTED_SIZE_MB)
                * 1024
                * 1024,
            prepublish_delay: Duration::from_millis(
                transfers_file.prepublish_delay_ms.unwrap_or(DEFAULT_PREPUBLISH_DELAY_MS),
            ),
            upload_concurrency: transfers_file.upload_concurrency.unwrap_or(DEFAULT_UPLOAD_CONCURRENCY),
        };

        Ok(Conf {
            listen_address,
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            database_path,
            downloads_dir,
            zoom,
            drive,
            moodle,
            transfers,
            wakeup_hour: conf_file.wakeup_hour.unwrap_or(DEFAULT_WAKEUP_HOUR),
        })
    }
}

fn parse_url_or(value: Option<&str>, default: &str) -> anyhow::Result<Url> {
    let raw = value.unwrap_or(default);
    Url::parse(raw).with_context(|| format!("invalid URL: {raw}"))
}

/// `0` disables the per-request ceiling entirely.
fn timeout_from_millis(value: Option<u64>) -> Option<Duration> {
    match value {
        None | Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
    }
}

/// Configuration handle shared between all tasks and handlers.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
    changed: Notify,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        let mut conf_file = load_conf_file_or_generate_new()?;
        apply_env_overrides(&mut conf_file).context("invalid environment override")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        })
    }

    /// Builds a handle from an already resolved configuration (tests, tools).
    pub fn mock(conf: Conf) -> Self {
        Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(dto::ConfFile::default())),
                changed: Notify::new(),
            }),
        }
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated)
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    /// Returns current configuration file state (do not hold it forever as it may become outdated)
    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        self.inner.conf_file.read().clone()
    }

    /// Waits for configuration to be changed
    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(path) = env::var("AGATEWAY_DATA_PATH") {
        Utf8PathBuf::from(path)
    } else {
        Utf8PathBuf::from("data")
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    if let Ok(path) = env::var("AGATEWAY_CONFIG_PATH") {
        Utf8PathBuf::from(path)
    } else {
        get_data_dir().join("gateway.json")
    }
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    let conf_file = match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => conf_file,
        None => {
            let defaults = dto::ConfFile::default();

            info!(
                path = %conf_file_path,
                "Writing default configuration to disk"
            );

            if let Some(parent) = conf_file_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("couldn't create directory {parent}"))?;
            }

            let json = serde_json::to_string_pretty(&defaults).context("couldn't serialize default configuration")?;

            std::fs::write(&conf_file_path, json)
                .with_context(|| format!("couldn't write config file at {conf_file_path}"))?;

            defaults
        }
    };

    Ok(conf_file)
}

/// Applies the environment variable surface on top of the configuration file.
///
/// Environment always wins over the file.
fn apply_env_overrides(conf_file: &mut dto::ConfFile) -> anyhow::Result<()> {
    let transfers = conf_file.transfers.get_or_insert_with(Default::default);

    override_parsed(&mut transfers.max_retries_download, "MAX_RETRIES_DOWNLOAD")?;
    override_parsed(&mut transfers.max_retries_upload, "MAX_RETRIES_UPLOAD")?;
    override_parsed(&mut transfers.initial_backoff_ms, "INITIAL_BACKOFF_MS")?;
    override_parsed(&mut transfers.max_backoff_ms, "MAX_BACKOFF_MS")?;
    override_parsed(&mut transfers.download_timeout_ms, "DOWNLOAD_TIMEOUT_MS")?;
    override_parsed(&mut transfers.upload_timeout_ms, "UPLOAD_TIMEOUT_MS")?;
    override_parsed(&mut transfers.chunk_size_mb, "CHUNK_SIZE_MB")?;
    override_parsed(&mut transfers.min_expected_size_mb, "MIN_EXPECTED_SIZE_MB")?;
    override_parsed(&mut transfers.prepublish_delay_ms, "PREPUBLISH_DELAY_MS")?;

    if let Some(dir) = read_env("DOWNLOADS_DIR") {
        conf_file.downloads_dir = Some(Utf8PathBuf::from(dir));
    }

    let moodle = conf_file.moodle.get_or_insert_with(Default::default);

    override_parsed(&mut moodle.default_course_id, "DEFAULT_COURSE_ID")?;
    override_parsed(&mut moodle.courses_cache_ms, "COURSES_CACHE_MS")?;

    let zoom = conf_file.zoom.get_or_insert_with(Default::default);

    if let Some(secret) = read_env("WEBHOOK_SECRET") {
        zoom.webhook_secret = Some(secret);
    }

    override_parsed(&mut zoom.webhook_disable_signature, "WEBHOOK_DISABLE_SIGNATURE")?;

    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn override_parsed<T: FromStr>(slot: &mut Option<T>, key: &str) -> anyhow::Result<()>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = read_env(key) {
        *slot = Some(value.parse::<T>().with_context(|| format!("couldn't parse ${key}"))?);
    }

    Ok(())
}

pub mod dto {
    use serde::{Deserialize, Serialize};

    use super::*;

    /// Source of truth for the configuration file format.
    ///
    /// Every field is optional so that partial files and older files stay readable.
    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Address the HTTP server binds to, e.g. "0.0.0.0:8080"
        #[serde(skip_serializing_if = "Option::is_none")]
        pub listen_address: Option<String>,
        /// Path to the log file or log folder
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,
        /// Path to the local database
        #[serde(skip_serializing_if = "Option::is_none")]
        pub database_path: Option<Utf8PathBuf>,
        /// Folder holding in-flight downloads
        #[serde(skip_serializing_if = "Option::is_none")]
        pub downloads_dir: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub zoom: Option<ZoomConfFile>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub drive: Option<DriveConfFile>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub moodle: Option<MoodleConfFile>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub transfers: Option<TransferConfFile>,
        /// Local hour (0–23) at which the preview wakeup job runs
        #[serde(skip_serializing_if = "Option::is_none")]
        pub wakeup_hour: Option<u8>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    pub struct ZoomConfFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub api_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub oauth_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub account_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub client_secret: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub webhook_secret: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub webhook_disable_signature: Option<bool>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    pub struct DriveConfFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub api_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub upload_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub access_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub root_folder_id: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    pub struct MoodleConfFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub base_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ws_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub default_course_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub courses_cache_ms: Option<u64>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    pub struct TransferConfFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_retries_download: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_retries_upload: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub initial_backoff_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_backoff_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub download_timeout_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub upload_timeout_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub chunk_size_mb: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub min_expected_size_mb: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub prepublish_delay_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub upload_concurrency: Option<usize>,
    }

    #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub enum VerbosityProfile {
        #[default]
        Default,
        Debug,
        All,
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,aula_gateway=debug",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_conf_file(json: &str) -> dto::ConfFile {
        serde_json::from_str(json).expect("valid test JSON")
    }

    #[test]
    fn defaults_are_resolved() {
        let conf_file = minimal_conf_file("{}");
        let conf = Conf::from_conf_file(&conf_file).expect("valid defaults");

        assert_eq!(conf.transfers.chunk_size, 32 * 1024 * 1024);
        assert_eq!(conf.transfers.min_expected_size, 1024 * 1024);
        assert_eq!(conf.transfers.upload_concurrency, 3);
        assert_eq!(conf.transfers.max_retries_download, 10);
        assert_eq!(conf.transfers.initial_backoff, Duration::from_secs(30));
        assert_eq!(conf.transfers.max_backoff, Duration::from_secs(300));
        assert!(conf.transfers.download_timeout.is_none());
        assert_eq!(conf.wakeup_hour, 2);
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let conf_file = minimal_conf_file(r#"{"Transfers": {"DownloadTimeoutMs": 0, "UploadTimeoutMs": 60000}}"#);
        let conf = Conf::from_conf_file(&conf_file).expect("valid file");

        assert!(conf.transfers.download_timeout.is_none());
        assert_eq!(conf.transfers.upload_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn webhook_secret_empty_string_is_treated_as_missing() {
        let conf_file = minimal_conf_file(r#"{"Zoom": {"WebhookSecret": ""}}"#);
        let conf = Conf::from_conf_file(&conf_file).expect("valid file");

        assert!(conf.zoom.webhook_secret.is_none());
    }
}
