#![allow(dead_code)]

use std::sync::Arc;

use aula_gateway::config::{dto, Conf, ConfHandle};
use aula_gateway::db::Db;
use aula_gateway::drive::DriveClient;
use aula_gateway::guards::PipelineContext;
use aula_gateway::moodle::MoodleClient;
use aula_gateway::zoom::ZoomClient;
use aula_gateway::AppState;
use aula_gateway_task::ShutdownHandle;
use camino::Utf8Path;

pub const WEBHOOK_SECRET: &str = "s3cret";

/// Offline application state: real clients pointed at unreachable localhost
/// endpoints, a real database in a temp directory. Good enough for every code
/// path that stops before an outbound call.
pub struct TestHarness {
    pub state: AppState,
    _tmp: tempfile::TempDir,
    _shutdown: ShutdownHandle,
}

pub async fn harness() -> TestHarness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = Utf8Path::from_path(tmp.path()).expect("utf8 tempdir");

    let conf_json = serde_json::json!({
        "DatabasePath": root.join("gateway.db"),
        "DownloadsDir": root.join("downloads"),
        "LogFile": root.join("gateway"),
        "Zoom": {
            "ApiUrl": "http://127.0.0.1:9/",
            "OauthUrl": "http://127.0.0.1:9/oauth/token",
            "WebhookSecret": WEBHOOK_SECRET,
        },
        "Drive": {
            "ApiUrl": "http://127.0.0.1:9/drive/",
            "UploadUrl": "http://127.0.0.1:9/upload",
        },
        "Moodle": { "BaseUrl": "http://127.0.0.1:9/moodle/" },
    });

    let conf_file: dto::ConfFile = serde_json::from_value(conf_json).expect("valid test configuration");
    let conf = Conf::from_conf_file(&conf_file).expect("resolvable test configuration");

    let db = Db::open(&conf.database_path).await.expect("open database");
    db.setup().await.expect("database migration");

    let zoom = Arc::new(ZoomClient::new(conf.zoom.clone()).expect("provider client"));
    let drive = Arc::new(DriveClient::new(conf.drive.clone()).expect("object-store client"));
    let moodle = Arc::new(MoodleClient::new(conf.moodle.clone()).expect("LMS client"));
    let guards = Arc::new(PipelineContext::new(conf.transfers.upload_concurrency));

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let state = AppState {
        conf_handle: ConfHandle::mock(conf),
        db,
        zoom,
        drive,
        moodle,
        guards,
        shutdown_signal,
    };

    TestHarness {
        state,
        _tmp: tmp,
        _shutdown: shutdown_handle,
    }
}
