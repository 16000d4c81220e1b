//! The agent core: registration, command polling, heartbeats and the
//! execution lifecycle.
//!
//! [`ExecutionServer::start`] spawns two long-lived tasks:
//!
//! 1. **Poll loop** ([`CommandPoller`]): consumes one pending command at a
//!    time and hands executions to the [`ExecutionManager`]
//! 2. **Heartbeat** ([`HeartbeatSender`]): reports in-flight ids every
//!    interval so the orchestrator can reconcile
//!
//! Each accepted execution then runs on its own task, which sends the single
//! terminal report for it.
//!
//! # Shutdown
//!
//! [`ExecutionServer::stop`] cancels both loops and waits for them. Execution
//! tasks are not awaited; they finish on their own or die with the runtime.

pub mod heartbeat;
pub mod lifecycle;
pub mod poll;
pub mod retry;
pub mod tracker;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::CommandHandler;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::orchestrator::OrchestratorClient;

pub use heartbeat::HeartbeatSender;
pub use lifecycle::ExecutionManager;
pub use poll::CommandPoller;
pub use retry::RetryPolicy;
pub use tracker::{ExecutionTracker, StopDisposition};

pub struct ExecutionServer {
    config: AgentConfig,
    client: Arc<OrchestratorClient>,
    manager: Arc<ExecutionManager>,
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl ExecutionServer {
    pub fn new(
        config: AgentConfig,
        client: Arc<OrchestratorClient>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let manager = Arc::new(ExecutionManager::new(
            Arc::clone(&client),
            handler,
            config.server.name.clone(),
            RetryPolicy::from_timing(&config.timing),
        ));
        Self {
            config,
            client,
            manager,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Logs in and builds a server. Fails if the credential exchange fails.
    pub async fn connect(config: AgentConfig, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        config.validate()?;
        let client = OrchestratorClient::connect(&config.orchestrator).await?;
        Ok(Self::new(config, Arc::new(client), handler))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<OrchestratorClient> {
        &self.client
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    /// Sorted ids of executions currently in flight.
    pub fn in_flight(&self) -> Vec<String> {
        self.manager.tracker().in_flight()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Creates the server identity on the orchestrator.
    pub async fn register(&self) -> Result<()> {
        let server = &self.config.server;
        self.client.register_server(server).await?;
        tracing::info!(server = %server.name, server_type = %server.server_type, capacity = server.capacity, "Registered execution server");
        Ok(())
    }

    /// Refreshes description and capacity of an existing identity.
    pub async fn update(&self) -> Result<()> {
        let server = &self.config.server;
        self.client.update_server(server).await?;
        tracing::info!(server = %server.name, capacity = server.capacity, "Updated execution server");
        Ok(())
    }

    /// Registers, falling back to an update when the name is already taken.
    pub async fn register_or_update(&self) -> Result<()> {
        match self.register().await {
            Err(e) if e.is_already_registered() => {
                tracing::info!(server = %self.config.server.name, "Execution server already registered, updating");
                self.update().await
            }
            other => other,
        }
    }

    /// Spawns the poll loop and the heartbeat. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.shutdown.is_some() {
            tracing::warn!(server = %self.config.server.name, "Execution server already started");
            return;
        }
        let shutdown = CancellationToken::new();
        let name = self.config.server.name.clone();
        let timing = &self.config.timing;

        let poller = CommandPoller::new(
            Arc::clone(&self.client),
            Arc::clone(&self.manager),
            name.clone(),
            timing.poll_backoff,
            RetryPolicy::from_timing(timing),
        );
        let poll_token = shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            poller.run(poll_token).await;
        }));

        let heartbeat = HeartbeatSender::new(timing.heartbeat_interval);
        let client = Arc::clone(&self.client);
        let tracker = Arc::clone(self.manager.tracker());
        let heartbeat_token = shutdown.clone();
        let heartbeat_name = name.clone();
        self.tasks.push(tokio::spawn(async move {
            heartbeat
                .run(client, heartbeat_name, tracker, heartbeat_token)
                .await;
        }));

        tracing::info!(server = %name, "Execution server started");
        self.shutdown = Some(shutdown);
    }

    /// Stops both loops and waits for them to exit. An outstanding long poll
    /// is allowed to complete first.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Execution server task failed");
            }
        }
        tracing::info!(server = %self.config.server.name, "Execution server stopped");
    }
}
