//! Receiver discovery.
//!
//! The [`DiscoveryManager`] runs one provider task per receiver group. Each
//! provider resolves its [`DiscoveryConfig`] through a [`Discoverer`] and
//! reports the resulting target groups back to the manager, which publishes
//! a full snapshot of all groups on the sync channel at most once per
//! update interval.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{Result, SenderError};

/// Default minimum time between two published snapshots
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the channel between discovery and delivery
///
/// Snapshots are complete, so a consumer that falls behind only needs the
/// latest one; publishing is retried on the next tick when it is full.
pub const SYNC_CHANNEL_CAPACITY: usize = 1;

const PROVIDER_UPDATE_BUFFER: usize = 64;

/// Targets of every receiver group, keyed by group name
pub type TargetSnapshot = HashMap<String, Vec<TargetGroup>>;

/// Create the channel discovery publishes snapshots on
pub fn sync_channel() -> (mpsc::Sender<TargetSnapshot>, mpsc::Receiver<TargetSnapshot>) {
    mpsc::channel(SYNC_CHANNEL_CAPACITY)
}

/// A set of resolved `host[:port]` addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGroup {
    /// Identifies the group within its discovery config
    pub source: String,
    pub targets: Vec<String>,
}

impl TargetGroup {
    pub fn new<I, S>(source: &str, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.to_string(),
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

/// A strategy for resolving receiver addresses
#[async_trait]
pub trait Discoverer: Send + Sync + Debug {
    /// Resolve the current target groups
    async fn discover(&self) -> Result<Vec<TargetGroup>>;

    /// How often to resolve again, `None` to resolve only once
    fn refresh_interval(&self) -> Option<Duration> {
        None
    }
}

/// How to find the addresses of a receiver
#[derive(Debug, Clone)]
pub enum DiscoveryConfig {
    /// Fixed addresses
    Static(Vec<TargetGroup>),
    /// A/AAAA lookups of `names`, re-resolved every `refresh_interval`
    Dns {
        names: Vec<String>,
        port: u16,
        refresh_interval: Duration,
    },
    /// Any other strategy
    Custom(Arc<dyn Discoverer>),
}

impl PartialEq for DiscoveryConfig {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Static(a), Self::Static(b)) => a == b,
            (
                Self::Dns {
                    names: a_names,
                    port: a_port,
                    refresh_interval: a_interval,
                },
                Self::Dns {
                    names: b_names,
                    port: b_port,
                    refresh_interval: b_interval,
                },
            ) => a_names == b_names && a_port == b_port && a_interval == b_interval,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl DiscoveryConfig {
    /// Whether `address` can be a target of this config
    ///
    /// Only static configs know their targets up front; any address is
    /// admitted for the other strategies.
    pub(crate) fn admits(&self, address: &str) -> bool {
        match self {
            Self::Static(groups) => groups
                .iter()
                .any(|group| group.targets.iter().any(|target| target == address)),
            Self::Dns { .. } | Self::Custom(_) => true,
        }
    }

    fn discoverer(&self) -> Arc<dyn Discoverer> {
        match self {
            Self::Static(groups) => Arc::new(StaticDiscoverer(groups.clone())),
            Self::Dns {
                names,
                port,
                refresh_interval,
            } => Arc::new(DnsDiscoverer {
                names: names.clone(),
                port: *port,
                refresh_interval: *refresh_interval,
            }),
            Self::Custom(discoverer) => discoverer.clone(),
        }
    }
}

#[derive(Debug)]
struct StaticDiscoverer(Vec<TargetGroup>);

#[async_trait]
impl Discoverer for StaticDiscoverer {
    async fn discover(&self) -> Result<Vec<TargetGroup>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug)]
struct DnsDiscoverer {
    names: Vec<String>,
    port: u16,
    refresh_interval: Duration,
}

#[async_trait]
impl Discoverer for DnsDiscoverer {
    async fn discover(&self) -> Result<Vec<TargetGroup>> {
        let mut groups = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let addrs = tokio::net::lookup_host((name.as_str(), self.port))
                .await
                .map_err(|err| SenderError::Discovery(format!("lookup {name}: {err}")))?;

            let mut targets: Vec<String> = addrs.map(|addr| addr.to_string()).collect();
            targets.sort();
            targets.dedup();
            groups.push(TargetGroup {
                source: name.clone(),
                targets,
            });
        }
        Ok(groups)
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh_interval)
    }
}

/// Settings for [`DiscoveryManager`]
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Minimum time between published snapshots, also the retry delay for
    /// discoverers that failed and have no refresh interval of their own
    pub update_interval: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }
}

/// Resolves discovery configs into target groups for every receiver group
#[derive(Debug, Default)]
pub struct DiscoveryManager {
    options: DiscoveryOptions,
    configs: Mutex<HashMap<String, DiscoveryConfig>>,
    reload: Notify,
}

impl DiscoveryManager {
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            options,
            configs: Mutex::new(HashMap::new()),
            reload: Notify::new(),
        }
    }

    /// Replace the watched configs
    ///
    /// A running manager stops providers of removed or changed groups and
    /// starts providers for new or changed ones.
    pub fn apply_config(&self, configs: HashMap<String, DiscoveryConfig>) {
        *self.configs.lock() = configs;
        self.reload.notify_one();
    }

    /// Resolve targets and publish snapshots on `sync_tx` until `cancel` fires
    ///
    /// All provider tasks have exited when this returns.
    pub async fn run(&self, sync_tx: mpsc::Sender<TargetSnapshot>, cancel: CancellationToken) {
        let (updates_tx, mut updates_rx) = mpsc::channel(PROVIDER_UPDATE_BUFFER);
        let mut providers = Providers {
            running: HashMap::new(),
            tasks: JoinSet::new(),
            updates: updates_tx,
            retry_interval: self.options.update_interval,
            next_generation: 0,
        };
        let mut targets = TargetSnapshot::new();

        let mut ticker = tokio::time::interval(self.options.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending = providers.reconcile(&self.configs.lock(), &mut targets, &cancel);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.reload.notified() => {
                    let configs = self.configs.lock().clone();
                    pending |= providers.reconcile(&configs, &mut targets, &cancel);
                }
                Some(update) = updates_rx.recv() => {
                    let current = providers
                        .running
                        .get(&update.group)
                        .is_some_and(|p| p.generation == update.generation);
                    if current {
                        targets.insert(update.group, update.groups);
                        pending = true;
                    }
                }
                Some(joined) = providers.tasks.join_next(), if !providers.tasks.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!(error = %err, "Discovery provider panicked");
                        }
                    }
                }
                _ = ticker.tick(), if pending => {
                    match sync_tx.try_send(targets.clone()) {
                        Ok(()) => pending = false,
                        Err(TrySendError::Full(_)) => {
                            debug!("Discovery receiver's channel was full, will retry the next cycle");
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("Discovery receiver is gone, stopping");
                            break;
                        }
                    }
                }
            }
        }

        providers.shutdown().await;
        debug!("Discovery manager stopped");
    }
}

struct Provider {
    config: DiscoveryConfig,
    generation: u64,
    cancel: CancellationToken,
}

struct ProviderUpdate {
    group: String,
    generation: u64,
    groups: Vec<TargetGroup>,
}

struct Providers {
    running: HashMap<String, Provider>,
    tasks: JoinSet<()>,
    updates: mpsc::Sender<ProviderUpdate>,
    retry_interval: Duration,
    next_generation: u64,
}

impl Providers {
    /// Returns true if the target snapshot changed.
    fn reconcile(
        &mut self,
        configs: &HashMap<String, DiscoveryConfig>,
        targets: &mut TargetSnapshot,
        parent: &CancellationToken,
    ) -> bool {
        let mut changed = false;

        self.running.retain(|name, provider| {
            if configs.get(name) == Some(&provider.config) {
                return true;
            }
            provider.cancel.cancel();
            // Targets of a changed group are stale until its new provider reports.
            if targets.remove(name).is_some() {
                changed = true;
            }
            debug!(group = %name, "Stopped discovery provider");
            false
        });

        for (name, config) in configs {
            if self.running.contains_key(name) {
                continue;
            }
            self.next_generation += 1;
            let provider = Provider {
                config: config.clone(),
                generation: self.next_generation,
                cancel: parent.child_token(),
            };
            self.tasks.spawn(run_provider(
                name.clone(),
                provider.generation,
                config.discoverer(),
                self.updates.clone(),
                self.retry_interval,
                provider.cancel.clone(),
            ));
            info!(group = %name, "Started discovery provider");
            self.running.insert(name.clone(), provider);
        }

        changed
    }

    async fn shutdown(mut self) {
        for provider in self.running.values() {
            provider.cancel.cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    error!(error = %err, "Discovery provider panicked");
                }
            }
        }
    }
}

async fn run_provider(
    group: String,
    generation: u64,
    discoverer: Arc<dyn Discoverer>,
    updates: mpsc::Sender<ProviderUpdate>,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = discoverer.discover() => result,
        };

        let wait = match result {
            Ok(groups) => {
                let update = ProviderUpdate {
                    group: group.clone(),
                    generation,
                    groups,
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = updates.send(update) => if sent.is_err() { return },
                }
                discoverer.refresh_interval()
            }
            Err(err) => {
                warn!(
                    group = %group,
                    error = %err,
                    "Failed to discover receivers, retrying the next cycle"
                );
                Some(discoverer.refresh_interval().unwrap_or(retry_interval))
            }
        };

        match wait {
            Some(wait) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            None => {
                cancel.cancelled().await;
                return;
            }
        }
    }
}
