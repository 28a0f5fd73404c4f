//! Agent runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sitelink_common::{Clock, LoggingConfig, SystemClock, TopicBuilder, init_tracing};

use crate::AgentArgs;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::gateway::PublishGateway;
use crate::mqtt::MqttGateway;
use crate::queue::DeliveryQueue;
use crate::status::SiteStatus;

/// How long workers get to finish their in-flight cycle after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Agent runner that manages the lifecycle of a telemetry agent.
///
/// Handles:
/// - Logging initialization
/// - Opening the durable delivery queue
/// - Starting the MQTT gateway (with online status and offline last-will)
/// - Task spawning and cooperative shutdown
/// - Closing the gateway and the store on Ctrl+C
///
/// # Example
///
/// ```ignore
/// use sitelink_delivery::{AgentArgs, AgentConfig, AgentRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = AgentArgs::parse_with_default("myagent.json5");
///     let config = MyAgentConfig::load(&args.config)?;
///
///     let mut runner = AgentRunner::new_with_args("myagent", config, Some(&args)).await?;
///
///     let gateway = runner.gateway();
///     let queue = runner.queue();
///     let shutdown = runner.shutdown_token();
///     runner.spawn(async move {
///         // Worker logic here, stopping when `shutdown` is cancelled
///     });
///
///     runner.run().await
/// }
/// ```
pub struct AgentRunner<C: AgentConfig> {
    /// Agent name for logging and status.
    name: String,
    /// Agent version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Broker gateway.
    gateway: Arc<MqttGateway>,
    /// Durable delivery queue.
    queue: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
    /// Cancelled on Ctrl+C or when a worker fails.
    shutdown: CancellationToken,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: AgentConfig> AgentRunner<C> {
    /// Create a new agent runner.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Open the delivery queue
    /// 3. Start the MQTT gateway
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new agent runner with CLI args for log level override.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&AgentArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                ..config.logging().clone()
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| AgentError::config(e.to_string()))?;

        tracing::info!(agent = %name, version = %version, site_id = config.site_id(), "Starting agent");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        // Store-open and client-construction failures abort startup.
        let queue = Arc::new(DeliveryQueue::open(config.store(), clock.clone()).await?);

        let identity = SiteStatus::online(&name, &version, config.site_id())
            .with_metadata(config.status_metadata());
        let gateway = match MqttGateway::connect(config.broker(), &config.topics(), identity) {
            Ok(gateway) => Arc::new(gateway),
            Err(e) => {
                queue.close().await;
                return Err(e.into());
            }
        };

        Ok(Self {
            name,
            version,
            config,
            gateway,
            queue,
            clock,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Get the agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the agent version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Topics this agent publishes on.
    pub fn topics(&self) -> TopicBuilder {
        self.config.topics()
    }

    /// Get a handle to the broker gateway.
    pub fn gateway(&self) -> Arc<dyn PublishGateway> {
        self.gateway.clone()
    }

    /// Get a handle to the delivery queue.
    pub fn queue(&self) -> Arc<DeliveryQueue> {
        self.queue.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Token cancelled when the agent is asked to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a worker task.
    ///
    /// Workers are expected to observe [`shutdown_token`](Self::shutdown_token)
    /// and return once it is cancelled.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(handle);
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged and stop the agent.
    pub fn spawn_with_error<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %name, error = %e, "Worker failed");
                shutdown.cancel();
            }
        });
        self.tasks.push(handle);
    }

    /// Run the agent until Ctrl+C is received or the shutdown token is cancelled.
    ///
    /// This will:
    /// 1. Wait for a shutdown signal
    /// 2. Cancel the shutdown token and let workers finish their cycle
    /// 3. Close the gateway (publishing the offline status)
    /// 4. Close the delivery queue
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            agent = %self.name,
            tasks = self.tasks.len(),
            "Agent running. Press Ctrl+C to stop."
        );

        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => tracing::info!(agent = %self.name, "Received shutdown signal"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
            },
            _ = self.shutdown.cancelled() => {
                tracing::info!(agent = %self.name, "Shutdown requested");
            }
        }

        self.shutdown.cancel();

        for mut task in self.tasks.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Worker terminated abnormally"),
                Err(_) => {
                    tracing::warn!("Worker did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        self.gateway.close().await;

        if let Ok(stats) = self.queue.stats().await {
            tracing::info!(
                pending = stats.pending,
                dead_letter = stats.dead_letter,
                "Delivery queue state at shutdown"
            );
        }
        self.queue.close().await;

        tracing::info!(agent = %self.name, "Goodbye!");

        Ok(())
    }
}
