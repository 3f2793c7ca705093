use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::Authenticator;
use crate::task::{ShutdownSignal, Task};

/// Periodically refreshes the credential store. Runs besides the request
/// handlers and never blocks them: the store only takes its exclusive lock
/// for the pointer swap.
pub struct ReloadTask {
    pub authenticator: Arc<Authenticator>,
    pub interval: Duration,
}

#[async_trait]
impl Task for ReloadTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "credentials reload";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick fires immediately; the initial load already happened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.authenticator.reload().await {
                        debug!("credentials refreshed");
                    }
                }
                _ = shutdown_signal.wait() => {
                    debug!("shutting down the reload task");
                    return Ok(());
                }
            }
        }
    }
}
