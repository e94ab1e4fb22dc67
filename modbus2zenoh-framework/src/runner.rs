//! Bridge lifecycle: logging, Zenoh session, workers, cooperative shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::BridgeArgs;
use crate::config::{BridgeConfig, LoggingConfig};
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::session::connect;
use crate::status::StatusPublisher;

/// How long workers get to finish in-flight work after shutdown is raised.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Manages the lifecycle of the bridge.
///
/// Workers receive a [`watch::Receiver<bool>`] from
/// [`shutdown_signal`](Self::shutdown_signal); on Ctrl+C the runner flips it
/// to `true` and waits for them to return. Workers still running after the
/// grace period are aborted.
pub struct BridgeRunner<C: BridgeConfig> {
    name: String,
    version: String,
    config: C,
    session: Arc<zenoh::Session>,
    publisher: Publisher,
    status_publisher: Option<StatusPublisher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner, honouring `--log-level` from the CLI.
    ///
    /// Initializes logging, connects to Zenoh and creates the publisher.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };
        crate::init_tracing(&log_config)?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(connect(config.zenoh()).await?);
        let publisher = Publisher::new(
            session.clone(),
            config.key_prefix(),
            config.serialization(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status_publisher: None,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Publish status messages on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Receiver that turns `true` once shutdown has been requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a worker task.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Run the bridge, publishing `metadata` with the "running" status.
    ///
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for Ctrl+C
    /// 3. Raise the shutdown signal and wait for workers (bounded)
    /// 4. Publish "offline" status (if enabled)
    /// 5. Close the Zenoh session
    pub async fn run_with_metadata(mut self, metadata: Option<serde_json::Value>) -> Result<()> {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }

        tracing::info!(bridge = %self.name, "Received shutdown signal");
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut self.tasks);
        let abort_handles: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Worker ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Workers did not stop in time, aborting"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        self.session
            .close()
            .await
            .map_err(|e| BridgeError::ZenohSession(e.to_string()))?;

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}
