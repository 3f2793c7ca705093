use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use prometheus_tenant_proxy::auth::Authenticator;
use prometheus_tenant_proxy::config::Conf;
use prometheus_tenant_proxy::listener::HttpListener;
use prometheus_tenant_proxy::proxy::Director;
use prometheus_tenant_proxy::reload::ReloadTask;
use prometheus_tenant_proxy::sigv4::AwsSigner;
use prometheus_tenant_proxy::task::{ChildTask, ShutdownHandle, ShutdownSignal, Task, spawn_task};
use prometheus_tenant_proxy::{ProxyState, log};
use tap::prelude::*;
use tokio::runtime::{self, Runtime};

#[allow(clippy::large_enum_variant)] // `Running` is bigger than `Stopped` but we don't care
enum ServiceState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct ProxyService {
    conf: Arc<Conf>,
    state: ServiceState,
}

impl ProxyService {
    pub fn load(conf: Conf) -> anyhow::Result<Self> {
        log::init(conf.log_directives.as_deref()).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));
        trace!(?conf);

        Ok(ProxyService {
            conf: Arc::new(conf),
            state: ServiceState::Stopped,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // spawn_tasks needs to run in the runtime in order to bind the socket
        // and perform the initial credential load.
        let tasks = runtime.block_on(spawn_tasks(Arc::clone(&self.conf)))?;

        trace!("tasks created");

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("a task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "a task failed"),
                    Err(error) => error!(%error, "something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ServiceState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match core::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("attempted to stop the proxy service, but it's already stopped");
            }
            ServiceState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("stopping the proxy service");

                // Send the shutdown signal to all tasks
                shutdown_handle.signal();

                runtime.block_on(async move {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("all tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("some tasks didn't terminate in time");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = ServiceState::Stopped;
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
        let child = spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf: Arc<Conf>) -> anyhow::Result<Tasks> {
    let client = reqwest::Client::builder()
        .build()
        .context("couldn't build the upstream HTTP client")?;

    let authenticator = Authenticator::open(&conf, client.clone())
        .await
        .context("initial credential load failed")?
        .pipe(Arc::new);

    let signer = conf
        .aws
        .then(|| AwsSigner::from_env().context("SigV4 signing requested, but AWS credentials are unusable"))
        .transpose()?
        .map(Arc::new);

    let state = ProxyState {
        conf: Arc::clone(&conf),
        authenticator: Arc::clone(&authenticator),
        director: Director::new(conf.upstream.clone()).pipe(Arc::new),
        signer,
        client,
    };

    let mut tasks = Tasks::new();

    let listener = HttpListener::init_and_bind(state)
        .await
        .context("failed to initialize the HTTP listener")?;
    tasks.register(listener);

    if let Some(interval) = conf.reload_interval {
        tasks.register(ReloadTask { authenticator, interval });
    }

    Ok(tasks)
}
