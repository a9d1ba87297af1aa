use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::config::{build_receiver_configs, discovery_configs, AdminConfiguration};
use crate::delivery::{DeliveryManager, DeliveryOptions};
use crate::discovery::{sync_channel, DiscoveryManager, DiscoveryOptions};
use crate::errors::{Result, SenderError};
use crate::metrics::SenderMetrics;
use crate::types::{Alert, OutboundAlert};

/// Lifecycle of a [`Sender`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Created,
    Configured,
    Running,
    /// Terminal; every further operation fails with [`SenderError::Closed`]
    Stopped,
}

/// Settings for the components a [`Sender`] builds itself
#[derive(Debug, Clone, Default)]
pub struct SenderOptions {
    pub discovery: DiscoveryOptions,
    pub delivery: DeliveryOptions,
}

/// Dispatches alerts to every configured receiver
///
/// Discovery and delivery run as two background tasks connected by the
/// discovery sync channel. Sending only queues alerts in memory.
///
/// Alerts sent after [`apply_config`](Self::apply_config) but before
/// [`run`](Self::run) stay queued and are delivered once the receivers have
/// been discovered. Alerts sent before any configuration was applied have
/// nowhere to go and are dropped.
///
/// # Example
///
/// ```rust,no_run
/// use alert_sender::{AdminConfiguration, Alert, Sender};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let sender = Sender::new()?;
///     sender.apply_config(&AdminConfiguration::new(["http://localhost:9093"]))?;
///     sender.run()?;
///
///     sender.send_alerts(&[Alert::new("HighMemoryUsage").with_label("service", "my-app")])?;
///
///     sender.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Sender {
    state: RwLock<SenderState>,
    discovery: Arc<DiscoveryManager>,
    delivery: Arc<DeliveryManager>,
    registry: Registry,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sender {
    /// Create a sender with default options and its own metrics registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new(), SenderOptions::default())
    }

    /// Create a sender whose metrics are registered on `registry`
    ///
    /// # Errors
    ///
    /// Fails if `registry` already holds a sender's metrics.
    pub fn with_registry(registry: Registry, options: SenderOptions) -> Result<Self> {
        let metrics = Arc::new(SenderMetrics::new(&registry)?);
        Ok(Self::with_managers(
            DiscoveryManager::new(options.discovery),
            DeliveryManager::new(options.delivery, metrics),
            registry,
        ))
    }

    /// Create a sender from already built components
    pub fn with_managers(
        discovery: DiscoveryManager,
        delivery: DeliveryManager,
        registry: Registry,
    ) -> Self {
        Self {
            state: RwLock::new(SenderState::Created),
            discovery: Arc::new(discovery),
            delivery: Arc::new(delivery),
            registry,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SenderState {
        *self.state.read()
    }

    /// Registry holding this sender's metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply a new receiver configuration, also while running
    ///
    /// # Errors
    ///
    /// Returns an error if any receiver URL is invalid; the previous
    /// configuration then stays in effect unchanged.
    pub fn apply_config(&self, cfg: &AdminConfiguration) -> Result<()> {
        let mut state = self.state.write();
        if *state == SenderState::Stopped {
            return Err(SenderError::Closed);
        }

        let receivers = build_receiver_configs(cfg)?;
        let discovery = discovery_configs(&receivers);
        let count = receivers.len();

        self.delivery.apply_config(receivers)?;
        self.discovery.apply_config(discovery);

        if *state == SenderState::Created {
            *state = SenderState::Configured;
        }
        info!(receivers = count, "Applied receiver configuration");
        Ok(())
    }

    /// Start the discovery and delivery background tasks
    ///
    /// # Errors
    ///
    /// Fails if the sender is already running or stopped, or if called
    /// outside a Tokio runtime.
    pub fn run(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            SenderState::Stopped => return Err(SenderError::Closed),
            SenderState::Running => return Err(SenderError::AlreadyRunning),
            SenderState::Created | SenderState::Configured => {}
        }
        let runtime = Handle::try_current().map_err(|_| SenderError::NoRuntime)?;

        let (sync_tx, sync_rx) = sync_channel();

        let discovery = self.discovery.clone();
        let cancel = self.cancel.clone();
        let discovery_task = runtime.spawn(async move { discovery.run(sync_tx, cancel).await });

        let delivery = self.delivery.clone();
        let cancel = self.cancel.clone();
        let delivery_task = runtime.spawn(async move { delivery.run(sync_rx, cancel).await });

        self.tasks.lock().extend([discovery_task, delivery_task]);
        *state = SenderState::Running;
        info!("Sender started");
        Ok(())
    }

    /// Sanitize alerts and queue them for every receiver
    ///
    /// Never waits on the network.
    ///
    /// # Errors
    ///
    /// Fails only if the sender has been stopped.
    pub fn send_alerts(&self, alerts: &[Alert]) -> Result<()> {
        // Held while queueing so `stop` cannot discard the queues in between.
        let state = self.state.read();
        if *state == SenderState::Stopped {
            return Err(SenderError::Closed);
        }

        if alerts.is_empty() {
            debug!("No alerts to send to receivers");
            return Ok(());
        }

        let outbound: Vec<OutboundAlert> = alerts.iter().map(OutboundAlert::from).collect();
        debug!(
            receiver_count = self.delivery.active().len(),
            alert_count = outbound.len(),
            "Sending alerts to receivers"
        );
        self.delivery.enqueue(outbound);
        Ok(())
    }

    /// Stop the background tasks and wait until they have exited
    ///
    /// Alerts still queued are dropped and logged.
    ///
    /// # Errors
    ///
    /// Fails if the sender was already stopped.
    pub async fn stop(&self) -> Result<()> {
        let tasks = {
            let mut state = self.state.write();
            if *state == SenderState::Stopped {
                return Err(SenderError::Closed);
            }
            *state = SenderState::Stopped;
            std::mem::take(&mut *self.tasks.lock())
        };

        self.cancel.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "Sender background task failed");
            }
        }
        // Covers alerts queued by a sender that never ran.
        self.delivery.discard_queued();

        info!("Sender stopped");
        Ok(())
    }

    /// Push URLs of the receivers currently sent to
    pub fn active_receivers(&self) -> Vec<Url> {
        self.delivery.active()
    }

    /// Push URLs of receivers recently removed by discovery or configuration
    pub fn dropped_receivers(&self) -> Vec<Url> {
        self.delivery.dropped()
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
