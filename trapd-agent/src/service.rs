use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use event_queue::{DynEventQueue, EventQueue as _};
use event_queue_libsql::LibSqlEventQueue;
use tokio::runtime::{self, Runtime};

use crate::config::{AgentPaths, Conf};
use crate::identity;
use crate::janitor::{DEFAULT_MAX_QUEUE_ROWS, QueueMaintenanceTask};
use crate::log::LoggerGuard;
use crate::secret;
use crate::sender::BatchSender;
use crate::task::{ChildTask, ShutdownHandle, ShutdownSignal, spawn_task};
use crate::transport::EventsClient;
use crate::worker::HeartbeatTask;
use crate::{log, version};

pub const SERVICE_NAME: &str = "trapd-agent";

/// Grace period granted to tasks per shutdown round.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const MAX_SHUTDOWN_ROUNDS: usize = 3;

#[allow(clippy::large_enum_variant)] // `Running` variant is bigger than `Stopped` but we don't care
enum AgentState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct AgentService {
    conf: Arc<Conf>,
    paths: AgentPaths,
    state: AgentState,
    _logger_guard: LoggerGuard,
}

impl AgentService {
    /// Resolves paths, loads configuration, and installs the logger.
    ///
    /// Everything that can make startup fatal for configuration reasons
    /// (unwritable data dir, missing project id) surfaces here.
    pub fn load() -> anyhow::Result<Self> {
        let paths = AgentPaths::resolve();
        paths.init().context("failed to prepare the data directory")?;

        let (conf, load_warnings) = Conf::load(&paths).context("invalid configuration")?;

        let logger_guard =
            log::init(paths.data_dir(), conf.log_level.to_log_filter()).context("failed to setup logger")?;

        info!(
            version = %version::agent_version(),
            data_dir = %paths.data_dir(),
            "TRAPD agent loaded"
        );

        for warning in load_warnings {
            warn!("{warning}");
        }

        Ok(Self {
            conf: Arc::new(conf),
            paths,
            state: AgentState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // The queue and the HTTP client are built on the runtime so their
        // I/O is bound to it.
        let tasks = runtime.block_on(spawn_tasks(Arc::clone(&self.conf), &self.paths))?;

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

        self.state = AgentState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, AgentState::Stopped) {
            AgentState::Stopped => {
                info!("Attempted to stop agent service, but it's already stopped");
            }
            AgentState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping agent service");

                shutdown_handle.signal();

                runtime.block_on(async move {
                    let mut rounds = 0;

                    loop {
                        tokio::select! {
                            () = shutdown_handle.all_closed() => {
                                debug!("All tasks are terminated");
                                break;
                            }
                            () = tokio::time::sleep(SHUTDOWN_GRACE) => {
                                rounds += 1;

                                if rounds >= MAX_SHUTDOWN_ROUNDS {
                                    warn!("Terminate forcefully the lingering tasks");
                                    break;
                                } else {
                                    warn!("Termination of certain tasks is experiencing significant delays");
                                }
                            }
                        }
                    }
                });

                // Wait a little longer before forcefully shutting down the runtime.
                runtime.shutdown_timeout(Duration::from_secs(1));

                self.state = AgentState::Stopped;
            }
        }
    }

    /// `--once` mode: exactly one collect → enqueue → drain cycle.
    pub fn run_single_cycle(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        runtime.block_on(async {
            let (mut heartbeat, _queue) = build_heartbeat(Arc::clone(&self.conf), &self.paths).await?;

            // The handle is kept alive so the signal stays silent for the
            // whole cycle.
            let (_shutdown_handle, mut shutdown_signal) = ShutdownHandle::new();

            heartbeat.tick(&mut shutdown_signal).await
        })
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
        T: crate::task::Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf: Arc<Conf>, paths: &AgentPaths) -> anyhow::Result<Tasks> {
    let (heartbeat, queue) = build_heartbeat(conf, paths).await?;

    let mut tasks = Tasks::new();

    tasks.register(heartbeat);
    tasks.register(QueueMaintenanceTask::new(queue, DEFAULT_MAX_QUEUE_ROWS));

    Ok(tasks)
}

/// Builds the heartbeat worker and everything underneath it: secret,
/// identity, queue, transport, sender.
async fn build_heartbeat(conf: Arc<Conf>, paths: &AgentPaths) -> anyhow::Result<(HeartbeatTask, DynEventQueue)> {
    let api_key = secret::read_api_key(&paths.api_key_file(), env::var("API_KEY_OVERRIDE").ok())
        .context("failed to read the api key")?;

    let sensor_id = identity::resolve(
        &paths.device_id_file(),
        env::var("SENSOR_ID_OVERRIDE").ok().as_deref(),
    );

    info!(
        sensor_id = %sensor_id.value(),
        source = %sensor_id.source(),
        "Resolved sensor identity"
    );

    let queue = LibSqlEventQueue::open(paths.queue_db().as_str())
        .await
        .context("failed to open the event queue")?;
    queue.setup().await.context("failed to setup the event queue")?;

    let queue: DynEventQueue = Arc::new(queue);

    let client = EventsClient::new(&conf.api_url, &api_key).context("failed to build the events client")?;
    let sender = BatchSender::new(Arc::clone(&queue), Arc::new(client), conf.batch_size);

    let heartbeat = HeartbeatTask::new(conf, Arc::clone(&queue), sender, sensor_id);

    Ok((heartbeat, queue))
}
