use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;

use crate::ProxyState;
use crate::task::{ShutdownSignal, Task};

/// The HTTP listener. Binding happens at init time so a busy port aborts
/// startup instead of failing silently inside a task.
pub struct HttpListener {
    listener: TcpListener,
    app: Router,
}

impl HttpListener {
    pub async fn init_and_bind(state: ProxyState) -> anyhow::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, state.conf.port));

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!(%addr, "listener started successfully");

        let app = crate::make_router(state);

        Ok(Self { listener, app })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("listener has no local address")
    }
}

#[async_trait]
impl Task for HttpListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move { shutdown_signal.wait().await })
            .await
            .context("HTTP server failure")
    }
}
