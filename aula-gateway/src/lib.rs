#[macro_use]
extern crate tracing;

use std::sync::Arc;

use aula_gateway_task::ShutdownSignal;

pub mod api;
pub mod config;
pub mod db;
pub mod download;
pub mod drive;
pub mod guards;
pub mod http;
pub mod log;
pub mod moodle;
pub mod pipeline;
pub mod republish;
pub mod resolver;
pub mod transfer;
pub mod wakeup;
pub mod zoom;

/// Ambient per-process state threaded into every handler and task.
///
/// The concurrency guards live in [`guards::PipelineContext`]; everything here
/// is either immutable after startup or internally synchronized.
#[derive(Clone)]
pub struct AppState {
    pub conf_handle: config::ConfHandle,
    pub db: db::Db,
    pub zoom: Arc<zoom::ZoomClient>,
    pub drive: Arc<drive::DriveClient>,
    pub moodle: Arc<moodle::MoodleClient>,
    pub guards: Arc<guards::PipelineContext>,
    pub shutdown_signal: ShutdownSignal,
}
