use std::time::Duration;

use tokio::time::Instant;

use crate::config::HeartbeatConfig;

/// Watches the orchestrator-side heartbeat endpoint from the calling
/// process.
///
/// The workload also probes the same endpoint from inside the cluster (curl
/// sidecar) and self-terminates when it fails, so an orphaned workload never
/// runs forever. This monitor is the local half: it lets the supervisor
/// declare the workload failed without waiting for the cluster to notice the
/// sidecar exit.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    grace_period: Duration,
}

impl HeartbeatMonitor {
    pub fn new(url: String, config: &HeartbeatConfig) -> Self {
        // Only fails when no TLS backend can be loaded, which is fatal for
        // the whole worker anyway; a fallback client would lose the probe
        // timeout and hang loss detection.
        let client = reqwest::Client::builder()
            .timeout(config.interval)
            .build()
            .expect("http client construction failed");
        Self {
            client,
            url,
            interval: config.interval,
            grace_period: config.grace_period,
        }
    }

    /// Resolves once the endpoint has been unreachable for longer than the
    /// grace period. Run under the supervisor's `select!`, so dropping the
    /// future cancels the monitor with the process.
    pub async fn lost(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_healthy = Instant::now();

        loop {
            ticker.tick().await;
            if self.probe().await {
                last_healthy = Instant::now();
            } else if last_healthy.elapsed() > self.grace_period {
                tracing::warn!(
                    url = %self.url,
                    grace_period = ?self.grace_period,
                    "Heartbeat endpoint unreachable past grace period"
                );
                return;
            }
        }
    }

    /// Healthy means a 2xx response; anything else counts as a failure.
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Heartbeat probe failed");
                false
            }
        }
    }
}
