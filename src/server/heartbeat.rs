use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::tracker::ExecutionTracker;
use crate::orchestrator::OrchestratorClient;

/// Periodically reports the in-flight execution ids to the orchestrator.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Sends a status report immediately and then once per interval until
    /// `shutdown` fires. Failures are logged and never stop the loop.
    pub async fn run(
        &self,
        client: Arc<OrchestratorClient>,
        server_name: String,
        tracker: Arc<ExecutionTracker>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let ids = tracker.in_flight();
            tracing::debug!(server = %server_name, executions = ?ids, "Sending heartbeat");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = client.report_status(&server_name, ids) => {
                    if let Err(e) = result {
                        tracing::warn!(server = %server_name, error = %e, "Heartbeat failed");
                    }
                }
            }
        }

        tracing::debug!(server = %server_name, "Heartbeat stopped");
    }
}
