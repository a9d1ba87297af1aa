//! Queueing and delivery of alerts to discovered receivers.
//!
//! Every receiver group owns a bounded queue and a dispatcher task. Alerts
//! are enqueued into every group's queue; the dispatcher drains its queue in
//! batches and pushes each batch to all currently active endpoints of the
//! group concurrently. Groups never wait on each other.
//!
//! A full queue drops its oldest alerts. A batch that no endpoint accepted
//! after retries is dropped. Every dropped alert is logged and counted in
//! `alert_sender_dropped_total`.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::client::{encode_batch, ReceiverClient, RetryPolicy};
use crate::config::{receiver_group_name, ReceiverConfig};
use crate::discovery::{TargetGroup, TargetSnapshot};
use crate::errors::Result;
use crate::metrics::SenderMetrics;
use crate::types::OutboundAlert;

/// Default capacity of each receiver group's queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default maximum number of alerts per push
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

/// Default number of dropped receivers remembered
pub const DEFAULT_DROPPED_HISTORY: usize = 100;

/// Settings for [`DeliveryManager`]
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub queue_capacity: usize,
    pub max_batch_size: usize,
    pub dropped_history: usize,
    pub retry: RetryPolicy,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            dropped_history: DEFAULT_DROPPED_HISTORY,
            retry: RetryPolicy::default(),
        }
    }
}

struct AlertQueue {
    alerts: Mutex<VecDeque<Arc<OutboundAlert>>>,
    capacity: usize,
}

impl AlertQueue {
    fn new(capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append alerts, dropping the oldest ones beyond capacity.
    ///
    /// Returns the number of alerts dropped.
    fn push(&self, alerts: &[Arc<OutboundAlert>]) -> usize {
        let mut dropped = 0;
        let incoming = if alerts.len() > self.capacity {
            dropped += alerts.len() - self.capacity;
            &alerts[alerts.len() - self.capacity..]
        } else {
            alerts
        };

        let mut queue = self.alerts.lock();
        let overflow = (queue.len() + incoming.len()).saturating_sub(self.capacity);
        queue.drain(..overflow);
        queue.extend(incoming.iter().cloned());

        dropped + overflow
    }

    fn next_batch(&self, max: usize) -> Vec<Arc<OutboundAlert>> {
        let mut queue = self.alerts.lock();
        let n = queue.len().min(max.max(1));
        queue.drain(..n).collect()
    }

    fn take_all(&self) -> Vec<Arc<OutboundAlert>> {
        self.alerts.lock().drain(..).collect()
    }

    fn len(&self) -> usize {
        self.alerts.lock().len()
    }
}

struct ReceiverGroup {
    name: String,
    config: ReceiverConfig,
    client: ReceiverClient,
    queue: AlertQueue,
    /// Push URLs of the currently active endpoints
    endpoints: RwLock<Vec<Url>>,
    wakeup: Notify,
    cancel: CancellationToken,
}

impl ReceiverGroup {
    fn update_queue_length(&self, metrics: &SenderMetrics) {
        metrics
            .queue_length
            .with_label_values(&[&self.name])
            .set(self.queue.len() as i64);
    }
}

/// Owns one queue per receiver group and delivers alerts to its endpoints
pub struct DeliveryManager {
    options: DeliveryOptions,
    metrics: Arc<SenderMetrics>,
    groups: RwLock<HashMap<String, Arc<ReceiverGroup>>>,
    dropped: Mutex<VecDeque<Url>>,
    /// Last snapshot received from discovery
    targets: Mutex<TargetSnapshot>,
    reload: Notify,
}

impl DeliveryManager {
    pub fn new(options: DeliveryOptions, metrics: Arc<SenderMetrics>) -> Self {
        metrics.queue_capacity.set(options.queue_capacity as i64);
        Self {
            options,
            metrics,
            groups: RwLock::new(HashMap::new()),
            dropped: Mutex::new(VecDeque::new()),
            targets: Mutex::new(TargetSnapshot::new()),
            reload: Notify::new(),
        }
    }

    /// Replace the receiver configs; the config at index `i` serves group `config-{i}`
    ///
    /// Unchanged groups are kept as they are. Changed groups keep their
    /// queued alerts. Removed groups discard their queue and their endpoints
    /// become dropped receivers.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built, in which case
    /// the previous configuration stays in place.
    pub fn apply_config(&self, configs: Vec<ReceiverConfig>) -> Result<()> {
        let mut groups = self.groups.write();
        let targets = self.targets.lock();

        let mut next = HashMap::with_capacity(configs.len());
        for (i, config) in configs.into_iter().enumerate() {
            let name = receiver_group_name(i);
            let existing = groups.get(&name);
            if let Some(existing) = existing.filter(|group| group.config == config) {
                next.insert(name, existing.clone());
                continue;
            }

            // The last snapshot only applies if it was resolved for this discovery config.
            let endpoints = match existing {
                Some(existing) if existing.config.discovery == config.discovery => {
                    endpoint_urls(&name, &config, targets.get(&name))
                }
                _ => Vec::new(),
            };
            let client = ReceiverClient::new(config.timeout, config.basic_auth.clone())?;
            let group = ReceiverGroup {
                name: name.clone(),
                config,
                client,
                queue: AlertQueue::new(self.options.queue_capacity),
                endpoints: RwLock::new(endpoints),
                wakeup: Notify::new(),
                cancel: CancellationToken::new(),
            };
            next.insert(name, Arc::new(group));
        }

        let previous = std::mem::replace(&mut *groups, next.clone());
        drop(targets);
        drop(groups);

        for (name, old) in previous {
            match next.get(&name) {
                Some(new) if Arc::ptr_eq(new, &old) => {}
                Some(new) => {
                    old.cancel.cancel();
                    let carried = old.queue.take_all();
                    let overflow = new.queue.push(&carried);
                    self.record_overflow(new, overflow);
                    let new_endpoints = new.endpoints.read().clone();
                    for url in old.endpoints.read().iter() {
                        if !new_endpoints.contains(url) {
                            self.record_dropped(url.clone());
                        }
                    }
                    new.update_queue_length(&self.metrics);
                    new.wakeup.notify_one();
                    debug!(group = %name, carried = carried.len(), "Receiver config changed");
                }
                None => {
                    old.cancel.cancel();
                    let discarded = old.queue.take_all().len();
                    if discarded > 0 {
                        warn!(
                            group = %name,
                            count = discarded,
                            "Receiver removed, dropping its queued alerts"
                        );
                        self.metrics.dropped.inc_by(discarded as u64);
                    }
                    for url in old.endpoints.read().iter() {
                        self.record_dropped(url.clone());
                    }
                    let _ = self.metrics.queue_length.remove_label_values(&[&name]);
                    info!(group = %name, "Receiver removed");
                }
            }
        }

        self.update_discovered();
        self.reload.notify_one();
        Ok(())
    }

    /// Add alerts to every receiver group's queue
    ///
    /// Never blocks on I/O and never fails; alerts that cannot be queued are
    /// logged and counted as dropped.
    pub fn enqueue(&self, alerts: Vec<OutboundAlert>) {
        if alerts.is_empty() {
            return;
        }
        let alerts: Vec<Arc<OutboundAlert>> = alerts.into_iter().map(Arc::new).collect();

        let groups = self.groups.read();
        if groups.is_empty() {
            debug!(count = alerts.len(), "No receivers configured, dropping alerts");
            self.metrics.dropped.inc_by(alerts.len() as u64);
            return;
        }

        for group in groups.values() {
            let overflow = group.queue.push(&alerts);
            self.record_overflow(group, overflow);
            group.update_queue_length(&self.metrics);
            group.wakeup.notify_one();
        }
    }

    /// Push URLs of all active receiver endpoints
    pub fn active(&self) -> Vec<Url> {
        let groups = self.groups.read();
        let mut names: Vec<&String> = groups.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| groups[name].endpoints.read().clone())
            .collect()
    }

    /// Push URLs of recently dropped receiver endpoints, oldest first
    pub fn dropped(&self) -> Vec<Url> {
        self.dropped.lock().iter().cloned().collect()
    }

    /// Number of alerts waiting in all queues
    pub fn queued(&self) -> usize {
        self.groups.read().values().map(|g| g.queue.len()).sum()
    }

    /// Consume discovery snapshots and dispatch queued alerts until `cancel` fires
    ///
    /// All dispatchers have exited and the remaining queued alerts have been
    /// dropped when this returns.
    pub async fn run(
        &self,
        mut sync_rx: mpsc::Receiver<TargetSnapshot>,
        cancel: CancellationToken,
    ) {
        let mut dispatchers: HashMap<String, Arc<ReceiverGroup>> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut sync_open = true;

        self.spawn_dispatchers(&mut dispatchers, &mut tasks);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.reload.notified() => self.spawn_dispatchers(&mut dispatchers, &mut tasks),
                snapshot = sync_rx.recv(), if sync_open => match snapshot {
                    Some(snapshot) => self.sync_targets(snapshot),
                    None => {
                        debug!("Discovery channel closed, keeping current receivers");
                        sync_open = false;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!(error = %err, "Alert dispatcher panicked");
                        }
                    }
                }
            }
        }

        for group in dispatchers.values() {
            group.cancel.cancel();
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    error!(error = %err, "Alert dispatcher panicked");
                }
            }
        }

        self.discard_queued();
        debug!("Delivery manager stopped");
    }

    /// Drop every queued alert, logging how many were lost per group
    pub fn discard_queued(&self) {
        for group in self.groups.read().values() {
            let discarded = group.queue.take_all().len();
            if discarded > 0 {
                warn!(
                    group = %group.name,
                    count = discarded,
                    "Sender stopped, dropping queued alerts"
                );
                self.metrics.dropped.inc_by(discarded as u64);
                group.update_queue_length(&self.metrics);
            }
        }
    }

    fn spawn_dispatchers(
        &self,
        dispatchers: &mut HashMap<String, Arc<ReceiverGroup>>,
        tasks: &mut JoinSet<()>,
    ) {
        let groups = self.groups.read();
        dispatchers.retain(|name, _| groups.contains_key(name));

        for (name, group) in groups.iter() {
            if dispatchers
                .get(name)
                .is_some_and(|running| Arc::ptr_eq(running, group))
            {
                continue;
            }
            dispatchers.insert(name.clone(), group.clone());
            tasks.spawn(dispatch(
                group.clone(),
                self.options.clone(),
                self.metrics.clone(),
            ));
        }
    }

    fn sync_targets(&self, snapshot: TargetSnapshot) {
        let groups = self.groups.read();
        for group in groups.values() {
            let urls = endpoint_urls(&group.name, &group.config, snapshot.get(&group.name));
            let mut active = group.endpoints.write();

            let removed: Vec<Url> = active.iter().filter(|u| !urls.contains(u)).cloned().collect();
            let added: Vec<Url> = urls.iter().filter(|u| !active.contains(u)).cloned().collect();
            if removed.is_empty() && added.is_empty() {
                continue;
            }

            for url in &added {
                info!(group = %group.name, url = %url, "Receiver discovered");
                self.dropped.lock().retain(|dropped| dropped != url);
            }
            for url in removed {
                info!(group = %group.name, url = %url, "Receiver no longer discovered, dropping");
                self.record_dropped(url);
            }

            *active = urls;
            drop(active);
            group.wakeup.notify_one();
        }

        // Stored before releasing the groups so apply_config never seeds
        // endpoints from an older snapshot than the one applied here.
        *self.targets.lock() = snapshot;
        drop(groups);
        self.update_discovered();
    }

    fn record_dropped(&self, url: Url) {
        let mut dropped = self.dropped.lock();
        dropped.retain(|existing| existing != &url);
        dropped.push_back(url);
        while dropped.len() > self.options.dropped_history {
            dropped.pop_front();
        }
    }

    fn record_overflow(&self, group: &ReceiverGroup, overflow: usize) {
        if overflow > 0 {
            warn!(
                group = %group.name,
                count = overflow,
                "Alert notification queue full, dropping oldest alerts"
            );
            self.metrics.dropped.inc_by(overflow as u64);
        }
    }

    fn update_discovered(&self) {
        let active: usize = self
            .groups
            .read()
            .values()
            .map(|g| g.endpoints.read().len())
            .sum();
        self.metrics.receivers_discovered.set(active as i64);
    }
}

/// Resolve a group's discovered addresses into push URLs
///
/// Addresses the group's discovery config cannot have produced are left out.
fn endpoint_urls(
    group: &str,
    config: &ReceiverConfig,
    targets: Option<&Vec<TargetGroup>>,
) -> Vec<Url> {
    let mut urls: Vec<Url> = Vec::new();
    for address in targets.into_iter().flatten().flat_map(|g| g.targets.iter()) {
        if !config.discovery.admits(address) {
            debug!(group, address = %address, "Ignoring address from a previous config");
            continue;
        }
        match config.endpoint_url(address) {
            Ok(url) if !urls.contains(&url) => urls.push(url),
            Ok(_) => {}
            Err(err) => {
                warn!(
                    group,
                    address = %address,
                    error = %err,
                    "Skipping receiver with invalid address"
                );
            }
        }
    }
    urls
}

/// Result of pushing one batch to every endpoint of a group
enum BatchOutcome {
    /// At least one endpoint accepted the batch
    Delivered,
    /// Every endpoint failed
    Failed,
    /// No endpoint accepted the batch before the group was cancelled
    Cancelled,
}

async fn dispatch(
    group: Arc<ReceiverGroup>,
    options: DeliveryOptions,
    metrics: Arc<SenderMetrics>,
) {
    'dispatch: loop {
        tokio::select! {
            _ = group.cancel.cancelled() => break,
            _ = group.wakeup.notified() => {}
        }

        loop {
            // Queued alerts of a cancelled group are carried over or discarded by the manager.
            if group.cancel.is_cancelled() {
                break 'dispatch;
            }
            let endpoints = group.endpoints.read().clone();
            if endpoints.is_empty() {
                // Alerts wait in the queue until discovery reports an endpoint.
                break;
            }
            let batch = group.queue.next_batch(options.max_batch_size);
            if batch.is_empty() {
                break;
            }
            group.update_queue_length(&metrics);

            match send_batch(&group, &endpoints, &batch, &options.retry, &metrics).await {
                BatchOutcome::Delivered => {}
                BatchOutcome::Failed => {
                    error!(
                        group = %group.name,
                        count = batch.len(),
                        "All receivers of the group failed, dropping alerts"
                    );
                    metrics.dropped.inc_by(batch.len() as u64);
                }
                BatchOutcome::Cancelled => {
                    warn!(
                        group = %group.name,
                        count = batch.len(),
                        "Delivery cancelled, dropping in-flight alerts"
                    );
                    metrics.dropped.inc_by(batch.len() as u64);
                    break 'dispatch;
                }
            }
        }
    }
    debug!(group = %group.name, "Dispatcher stopped");
}

/// Push a batch to every endpoint concurrently
///
/// Pushes stop early once the group is cancelled. Metrics are only updated
/// for pushes that ran to completion.
async fn send_batch(
    group: &ReceiverGroup,
    endpoints: &[Url],
    batch: &[Arc<OutboundAlert>],
    retry: &RetryPolicy,
    metrics: &Arc<SenderMetrics>,
) -> BatchOutcome {
    let body = match encode_batch(batch.iter().map(Arc::as_ref)) {
        Ok(body) => Bytes::from(body),
        Err(err) => {
            error!(group = %group.name, error = %err, "Failed to encode alerts");
            return BatchOutcome::Failed;
        }
    };
    let count = batch.len() as u64;

    let mut pushes = JoinSet::new();
    for url in endpoints {
        let client = group.client.clone();
        let url = url.clone();
        let body = body.clone();
        let retry = retry.clone();
        let metrics = metrics.clone();
        let cancel = group.cancel.clone();
        pushes.spawn(async move {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                result = client.push_with_retry(&url, &body, &retry) => result,
                _ = cancel.cancelled() => return None,
            };
            metrics
                .latency
                .with_label_values(&[url.as_str()])
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    metrics.sent.with_label_values(&[url.as_str()]).inc_by(count);
                    Some(true)
                }
                Err(err) => {
                    error!(url = %url, count, error = %err, "Error sending alerts");
                    metrics.errors.with_label_values(&[url.as_str()]).inc();
                    Some(false)
                }
            }
        });
    }

    let mut delivered = false;
    let mut cancelled = false;
    while let Some(joined) = pushes.join_next().await {
        match joined {
            Ok(Some(accepted)) => delivered |= accepted,
            Ok(None) => cancelled = true,
            Err(err) => error!(group = %group.name, error = %err, "Push task failed"),
        }
    }

    if delivered {
        BatchOutcome::Delivered
    } else if cancelled {
        BatchOutcome::Cancelled
    } else {
        BatchOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_receiver_configs, AdminConfiguration};
    use crate::discovery::{sync_channel, DiscoveryConfig};
    use crate::types::Alert;
    use prometheus::Registry;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(5);

    fn manager(options: DeliveryOptions) -> (Arc<DeliveryManager>, Arc<SenderMetrics>) {
        let metrics = Arc::new(SenderMetrics::new(&Registry::new()).unwrap());
        (Arc::new(DeliveryManager::new(options, metrics.clone())), metrics)
    }

    fn fast_options() -> DeliveryOptions {
        DeliveryOptions {
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            ..DeliveryOptions::default()
        }
    }

    fn receivers(urls: &[&str]) -> Vec<ReceiverConfig> {
        build_receiver_configs(&AdminConfiguration::new(urls.iter().copied())).unwrap()
    }

    /// A receiver resolved by DNS, so any discovered port is accepted
    fn dns_receiver(url: &str) -> ReceiverConfig {
        let mut config = ReceiverConfig::from_url(url).unwrap();
        config.discovery = DiscoveryConfig::Dns {
            names: vec!["a".to_string()],
            port: 9093,
            refresh_interval: Duration::from_secs(30),
        };
        config
    }

    fn snapshot(groups: &[(&str, &str)]) -> TargetSnapshot {
        groups
            .iter()
            .map(|(name, address)| (name.to_string(), vec![TargetGroup::new("0", [*address])]))
            .collect()
    }

    fn alerts(n: usize) -> Vec<OutboundAlert> {
        (0..n)
            .map(|i| OutboundAlert::from(&Alert::new(&format!("Alert{i}"))))
            .collect()
    }

    fn alert_names(batch: &[Arc<OutboundAlert>]) -> Vec<String> {
        batch
            .iter()
            .map(|a| a.labels.get("alertname").unwrap_or_default().to_string())
            .collect()
    }

    async fn wait_for_delivered(server: &MockServer, expected: usize) {
        tokio::time::timeout(WAIT, async {
            loop {
                let delivered: usize = server
                    .received_requests()
                    .await
                    .unwrap_or_default()
                    .iter()
                    .map(|r| r.body_json::<Vec<serde_json::Value>>().unwrap().len())
                    .sum();
                if delivered >= expected {
                    return delivered;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("alerts not delivered in time");
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let queue = AlertQueue::new(3);
        let batch: Vec<_> = alerts(2).into_iter().map(Arc::new).collect();
        assert_eq!(queue.push(&batch), 0);

        let more: Vec<_> = alerts(4).into_iter().skip(2).map(Arc::new).collect();
        assert_eq!(queue.push(&more), 1);

        assert_eq!(alert_names(&queue.take_all()), vec!["Alert1", "Alert2", "Alert3"]);
    }

    #[test]
    fn test_queue_keeps_newest_of_oversized_push() {
        let queue = AlertQueue::new(2);
        let batch: Vec<_> = alerts(5).into_iter().map(Arc::new).collect();

        assert_eq!(queue.push(&batch), 3);
        assert_eq!(alert_names(&queue.take_all()), vec!["Alert3", "Alert4"]);
    }

    #[test]
    fn test_queue_batches_bounded() {
        let queue = AlertQueue::new(100);
        let batch: Vec<_> = alerts(10).into_iter().map(Arc::new).collect();
        queue.push(&batch);

        assert_eq!(queue.next_batch(4).len(), 4);
        assert_eq!(queue.next_batch(4).len(), 4);
        assert_eq!(queue.next_batch(4).len(), 2);
        assert!(queue.next_batch(4).is_empty());
    }

    #[test]
    fn test_enqueue_without_receivers_is_counted() {
        let (manager, metrics) = manager(DeliveryOptions::default());

        manager.enqueue(alerts(3));

        assert_eq!(manager.queued(), 0);
        assert_eq!(metrics.dropped_total(), 3);
    }

    #[test]
    fn test_enqueue_fills_every_group() {
        let (manager, _) = manager(DeliveryOptions::default());
        manager
            .apply_config(receivers(&["http://a:9093", "http://b:9093"]))
            .unwrap();

        manager.enqueue(alerts(2));

        assert_eq!(manager.queued(), 4);
    }

    #[test]
    fn test_enqueue_overflow_counted() {
        let (manager, metrics) = manager(DeliveryOptions {
            queue_capacity: 2,
            ..DeliveryOptions::default()
        });
        manager.apply_config(receivers(&["http://a:9093"])).unwrap();

        manager.enqueue(alerts(3));

        assert_eq!(manager.queued(), 2);
        assert_eq!(metrics.dropped_total(), 1);
    }

    #[test]
    fn test_sync_targets_tracks_active_and_dropped() {
        let (manager, _) = manager(DeliveryOptions::default());
        manager
            .apply_config(receivers(&["http://a:9093", "http://b:9093/am"]))
            .unwrap();

        manager.sync_targets(snapshot(&[("config-0", "a:9093"), ("config-1", "b:9093")]));
        let active: Vec<String> = manager.active().iter().map(Url::to_string).collect();
        assert_eq!(
            active,
            vec!["http://a:9093/api/v2/alerts", "http://b:9093/am/api/v2/alerts"]
        );
        assert!(manager.dropped().is_empty());

        manager.sync_targets(snapshot(&[("config-0", "a:9093")]));
        assert_eq!(manager.active().len(), 1);
        assert_eq!(
            manager.dropped(),
            vec![Url::parse("http://b:9093/am/api/v2/alerts").unwrap()]
        );

        // Rediscovered receivers leave the dropped list.
        manager.sync_targets(snapshot(&[("config-0", "a:9093"), ("config-1", "b:9093")]));
        assert_eq!(manager.active().len(), 2);
        assert!(manager.dropped().is_empty());
    }

    #[test]
    fn test_dropped_history_capped() {
        let (manager, _) = manager(DeliveryOptions {
            dropped_history: 2,
            ..DeliveryOptions::default()
        });
        manager.apply_config(vec![dns_receiver("http://a:9093")]).unwrap();

        for port in 1..=4 {
            let address = format!("a:{port}");
            manager.sync_targets(snapshot(&[("config-0", address.as_str())]));
        }
        manager.sync_targets(TargetSnapshot::new());

        let dropped: Vec<String> = manager.dropped().iter().map(Url::to_string).collect();
        assert_eq!(
            dropped,
            vec!["http://a:3/api/v2/alerts", "http://a:4/api/v2/alerts"]
        );
    }

    #[test]
    fn test_removed_receiver_discards_queue_and_is_dropped() {
        let (manager, metrics) = manager(DeliveryOptions::default());
        manager.apply_config(receivers(&["http://a:9093"])).unwrap();
        manager.sync_targets(snapshot(&[("config-0", "a:9093")]));
        manager.enqueue(alerts(2));

        manager.apply_config(vec![]).unwrap();

        assert_eq!(manager.queued(), 0);
        assert_eq!(metrics.dropped_total(), 2);
        assert!(manager.active().is_empty());
        assert_eq!(manager.dropped().len(), 1);
    }

    #[test]
    fn test_changed_receiver_keeps_queue() {
        let (manager, metrics) = manager(DeliveryOptions::default());
        manager.apply_config(receivers(&["http://a:9093"])).unwrap();
        manager.sync_targets(snapshot(&[("config-0", "a:9093")]));
        manager.enqueue(alerts(2));

        manager.apply_config(receivers(&["https://a:9093"])).unwrap();

        assert_eq!(manager.queued(), 2);
        assert_eq!(metrics.dropped_total(), 0);
        assert_eq!(
            manager.active(),
            vec![Url::parse("https://a:9093/api/v2/alerts").unwrap()]
        );
        assert_eq!(
            manager.dropped(),
            vec![Url::parse("http://a:9093/api/v2/alerts").unwrap()]
        );
    }

    #[test]
    fn test_host_change_does_not_reuse_old_endpoints() {
        let (manager, _) = manager(DeliveryOptions::default());
        manager.apply_config(receivers(&["http://old-host:9093"])).unwrap();
        manager.sync_targets(snapshot(&[("config-0", "old-host:9093")]));
        manager.enqueue(alerts(1));

        manager
            .apply_config(receivers(&["http://user:pw@new-host:9093"]))
            .unwrap();

        assert!(manager.active().is_empty());
        assert_eq!(manager.queued(), 1);
        assert_eq!(
            manager.dropped(),
            vec![Url::parse("http://old-host:9093/api/v2/alerts").unwrap()]
        );

        // A snapshot resolved for the old config is still ignored.
        manager.sync_targets(snapshot(&[("config-0", "old-host:9093")]));
        assert!(manager.active().is_empty());

        manager.sync_targets(snapshot(&[("config-0", "new-host:9093")]));
        assert_eq!(
            manager.active(),
            vec![Url::parse("http://new-host:9093/api/v2/alerts").unwrap()]
        );
    }

    #[test]
    fn test_concurrent_sync_and_apply_end_consistent() {
        let (manager, _) = manager(DeliveryOptions::default());
        manager
            .apply_config(vec![dns_receiver("http://a:9093/x")])
            .unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for port in 0..200 {
                    let address = format!("a:{}", 1000 + port);
                    manager.sync_targets(snapshot(&[("config-0", address.as_str())]));
                }
                manager.sync_targets(snapshot(&[("config-0", "a:9093")]));
            });
            scope.spawn(|| {
                for i in 0..200 {
                    let prefix = if i % 2 == 0 { "y" } else { "x" };
                    manager
                        .apply_config(vec![dns_receiver(&format!("http://a:9093/{prefix}"))])
                        .unwrap();
                }
            });
        });

        assert_eq!(
            manager.active(),
            vec![Url::parse("http://a:9093/x/api/v2/alerts").unwrap()]
        );
    }

    #[test]
    fn test_discard_queued_counts_alerts() {
        let (manager, metrics) = manager(DeliveryOptions::default());
        manager.apply_config(receivers(&["http://a:9093"])).unwrap();
        manager.enqueue(alerts(5));

        manager.discard_queued();

        assert_eq!(manager.queued(), 0);
        assert_eq!(metrics.dropped_total(), 5);
    }

    #[tokio::test]
    async fn test_run_delivers_to_discovered_receiver() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/alerts"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        let address = mock_server.address().to_string();

        let (manager, metrics) = manager(fast_options());
        manager.apply_config(receivers(&[mock_server.uri().as_str()])).unwrap();
        // Queued before any endpoint is known.
        manager.enqueue(alerts(3));

        let (sync_tx, sync_rx) = sync_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(sync_rx, cancel).await }
        });

        sync_tx.send(snapshot(&[("config-0", address.as_str())])).await.unwrap();
        wait_for_delivered(&mock_server, 3).await;

        assert_eq!(manager.queued(), 0);
        assert_eq!(metrics.dropped_total(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_receiver_drops_batch_after_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&mock_server)
            .await;
        let address = mock_server.address().to_string();

        let (manager, metrics) = manager(fast_options());
        manager.apply_config(receivers(&[mock_server.uri().as_str()])).unwrap();

        let (sync_tx, sync_rx) = sync_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(sync_rx, cancel).await }
        });
        sync_tx.send(snapshot(&[("config-0", address.as_str())])).await.unwrap();
        wait_until(|| !manager.active().is_empty()).await;

        manager.enqueue(alerts(2));
        let counter = metrics.clone();
        wait_until(move || counter.dropped_total() == 2).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_receiver_does_not_block_other_groups() {
        let slow = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&slow)
            .await;
        let fast = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&fast)
            .await;

        let (slow_uri, fast_uri) = (slow.uri(), fast.uri());
        let (slow_address, fast_address) = (slow.address().to_string(), fast.address().to_string());
        let (manager, _) = manager(fast_options());
        manager
            .apply_config(receivers(&[slow_uri.as_str(), fast_uri.as_str()]))
            .unwrap();

        let (sync_tx, sync_rx) = sync_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move { manager.run(sync_rx, cancel).await }
        });
        sync_tx
            .send(snapshot(&[
                ("config-0", slow_address.as_str()),
                ("config-1", fast_address.as_str()),
            ]))
            .await
            .unwrap();
        wait_until(|| manager.active().len() == 2).await;

        manager.enqueue(alerts(1));

        wait_for_delivered(&fast, 1).await;

        // Cancelling the in-flight push to the slow receiver returns promptly.
        cancel.cancel();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
