use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use aula_gateway::config::ConfHandle;
use aula_gateway::db::Db;
use aula_gateway::drive::DriveClient;
use aula_gateway::guards::PipelineContext;
use aula_gateway::log::{self, LoggerGuard};
use aula_gateway::moodle::MoodleClient;
use aula_gateway::wakeup::PreviewWakeupTask;
use aula_gateway::zoom::ZoomClient;
use aula_gateway::{api, AppState};
use aula_gateway_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task};
use tap::prelude::*;
use tokio::runtime::{self, Runtime};

pub const SERVICE_NAME: &str = "aula-gateway";

#[allow(clippy::large_enum_variant)] // `Running` variant is bigger than `Stopped` but we don't care
enum GatewayState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct GatewayService {
    conf_handle: ConfHandle,
    state: GatewayState,
    _logger_guard: LoggerGuard,
}

impl GatewayService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard =
            log::init(&conf.log_file, conf.verbosity_profile.to_log_filter()).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        if conf.zoom.webhook_disable_signature {
            warn!("**WEBHOOK SIGNATURE VERIFICATION IS DISABLED, PLEASE DO NOT USE IN PRODUCTION**");
        }

        if conf.zoom.webhook_secret.is_none() {
            warn!("No webhook secret is configured; webhook events will be ignored");
        }

        Ok(GatewayService {
            conf_handle,
            state: GatewayState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        // spawn_tasks needs the runtime to bind the listener and open the database.
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = GatewayState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, GatewayState::Stopped) {
            GatewayState::Stopped => {
                info!("Attempted to stop gateway service, but it's already stopped");
            }
            GatewayState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping gateway service");

                // Send shutdown signals to all tasks
                shutdown_handle.signal();

                runtime.block_on(async move {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn’t terminate at all");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = GatewayState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = aula_gateway_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let conf = conf_handle.get_conf();

    let db = Db::open(&conf.database_path)
        .await
        .with_context(|| format!("couldn't open the database at {}", conf.database_path))?;
    db.setup().await.context("database migration")?;

    let zoom = ZoomClient::new(conf.zoom.clone())
        .context("couldn't build the provider client")?
        .pipe(Arc::new);
    let drive = DriveClient::new(conf.drive.clone())
        .context("couldn't build the object-store client")?
        .pipe(Arc::new);
    let moodle = MoodleClient::new(conf.moodle.clone())
        .context("couldn't build the LMS client")?
        .pipe(Arc::new);

    let guards = Arc::new(PipelineContext::new(conf.transfers.upload_concurrency));

    let mut tasks = Tasks::new();

    let state = AppState {
        conf_handle: conf_handle.clone(),
        db,
        zoom,
        drive,
        moodle,
        guards,
        shutdown_signal: tasks.shutdown_signal.clone(),
    };

    let listener = tokio::net::TcpListener::bind(conf.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", conf.listen_address))?;

    info!(address = %conf.listen_address, "HTTP listener bound");

    tasks.register(HttpServerTask {
        listener,
        state: state.clone(),
    });

    tasks.register(PreviewWakeupTask { state });

    Ok(tasks)
}

struct HttpServerTask {
    listener: tokio::net::TcpListener,
    state: AppState,
}

#[async_trait]
impl Task for HttpServerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http server";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let router = api::make_router::<()>(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown_signal.wait().await })
            .await
            .context("HTTP server failure")
    }
}
