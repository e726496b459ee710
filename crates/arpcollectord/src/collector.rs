//! Collector - fans every per-network watcher into one cache stream
//!
//! ```text
//!  watcher(eth0) ──┐                                   ┌── seeder (self, gateway)
//!  watcher(eth1) ──┼──▶ intake ──▶ aggregator ──▶ output ◀┘
//!  watcher(wlan0) ─┘   (mpsc)     (online only)   (mpsc) ──▶ CacheStream
//! ```
//!
//! Both channels are bounded: a slow consumer blocks the aggregator and the
//! seeder instead of dropping messages. One cancellation token ends every
//! task the collector spawned.

use crate::config::ArpConfig;
use crate::enumerator::NetworkEnumerator;
use crate::error::{CollectorError, Result};
use crate::metrics::CollectorMetrics;
use crate::types::{CacheMessage, NeighborEntry, NetworkTuple};
use crate::watcher::{NeighborWatcher, WatcherBuilder, WatcherSettings};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Time a watcher task gets to finish after being stopped
const WATCHER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A watcher bound to the network it monitors
pub struct HandlerSet {
    watcher: Arc<dyn NeighborWatcher>,
    network: NetworkTuple,
}

impl HandlerSet {
    pub fn network(&self) -> &NetworkTuple {
        &self.network
    }

    /// Static entry for the host's own address on this network
    fn self_message(&self) -> CacheMessage {
        CacheMessage::fixed(NeighborEntry::observed(
            self.network.interface.mac,
            self.network.host_ip(),
            true,
        ))
    }

    /// Static entry for the gateway, if the network has one and it answers
    async fn gateway_message(&self) -> Option<Result<CacheMessage>> {
        let gateway = self.network.gateway?;
        let result = self.watcher.who_is(gateway).await.and_then(|entry| {
            if entry.mac.is_zero() {
                return Err(CollectorError::Lookup {
                    ip: gateway,
                    reason: "resolved to zero MAC".to_string(),
                });
            }
            Ok(CacheMessage::fixed(entry))
        });
        Some(result)
    }
}

/// Handlers built so far during construction
///
/// Every watcher still held when this is dropped gets stopped, so a failed
/// `Collector::new` leaves nothing running.
struct PendingHandlers(Vec<HandlerSet>);

impl PendingHandlers {
    fn commit(mut self) -> Vec<HandlerSet> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for PendingHandlers {
    fn drop(&mut self) {
        for handler in &self.0 {
            debug!(
                interface = %handler.network.interface.name,
                "Releasing watcher after failed construction"
            );
            handler.watcher.stop();
        }
    }
}

/// Read side of the collector's output
///
/// Yields `None` once the collector is closed, even if messages are still
/// buffered.
pub struct CacheStream {
    rx: mpsc::Receiver<CacheMessage>,
    cancel: CancellationToken,
}

impl CacheStream {
    pub async fn recv(&mut self) -> Option<CacheMessage> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }
}

/// Channel ends and task handles, taken apart by `start` and `close`
#[derive(Default)]
struct Runtime {
    intake_tx: Option<mpsc::Sender<NeighborEntry>>,
    intake_rx: Option<mpsc::Receiver<NeighborEntry>>,
    output_tx: Option<mpsc::Sender<CacheMessage>>,
    output_rx: Option<mpsc::Receiver<CacheMessage>>,
    watcher_tasks: Vec<JoinHandle<()>>,
    aggregator: Option<JoinHandle<()>>,
}

/// Multi-network neighbor collector
pub struct Collector {
    handlers: Vec<HandlerSet>,
    cancel: CancellationToken,
    runtime: Mutex<Runtime>,
    started: AtomicBool,
    closed: AtomicBool,
    metrics: CollectorMetrics,
}

impl Collector {
    /// Discovers the local networks and builds one watcher for each
    ///
    /// # Errors
    ///
    /// [`CollectorError::Config`] for invalid settings,
    /// [`CollectorError::Discovery`] if enumeration fails and
    /// [`CollectorError::Construction`] if any watcher cannot be built. In the
    /// latter case every watcher built before the failure is stopped.
    #[instrument(skip_all, fields(subnets = config.subnets.len()))]
    pub fn new(
        config: &ArpConfig,
        enumerator: &dyn NetworkEnumerator,
        builder: &dyn WatcherBuilder,
    ) -> Result<Self> {
        Self::with_metrics(config, enumerator, builder, CollectorMetrics::new()?)
    }

    /// Same as [`Collector::new`] with caller-provided metrics
    pub fn with_metrics(
        config: &ArpConfig,
        enumerator: &dyn NetworkEnumerator,
        builder: &dyn WatcherBuilder,
        metrics: CollectorMetrics,
    ) -> Result<Self> {
        config.validate()?;
        let networks = enumerator.discover(&config.subnets)?;
        let settings = WatcherSettings::from(config);

        let mut pending = PendingHandlers(Vec::with_capacity(networks.len()));
        for network in networks {
            let watcher = builder
                .build(&network, settings)
                .map_err(|e| match e {
                    CollectorError::Construction { .. } => e,
                    other => CollectorError::Construction {
                        interface: network.interface.name.clone(),
                        reason: other.to_string(),
                    },
                })?;
            debug!(
                interface = %network.interface.name,
                network = %network.network,
                gateway = ?network.gateway,
                "Built watcher"
            );
            pending.0.push(HandlerSet { watcher, network });
        }
        let handlers = pending.commit();

        let (intake_tx, intake_rx) = mpsc::channel(config.channel_capacity);
        let (output_tx, output_rx) = mpsc::channel(config.channel_capacity);

        info!(
            networks = handlers.len(),
            capacity = config.channel_capacity,
            "Collector created"
        );

        Ok(Self {
            handlers,
            cancel: CancellationToken::new(),
            runtime: Mutex::new(Runtime {
                intake_tx: Some(intake_tx),
                intake_rx: Some(intake_rx),
                output_tx: Some(output_tx),
                output_rx: Some(output_rx),
                ..Runtime::default()
            }),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Networks being watched, in discovery order
    pub fn networks(&self) -> impl Iterator<Item = &NetworkTuple> {
        self.handlers.iter().map(HandlerSet::network)
    }

    pub fn metrics(&self) -> &CollectorMetrics {
        &self.metrics
    }

    /// Hands out the output stream; only the first call gets it
    pub fn take_cache_stream(&self) -> Option<CacheStream> {
        self.runtime.lock().output_rx.take().map(|rx| CacheStream {
            rx,
            cancel: self.cancel.clone(),
        })
    }

    /// Starts every watcher, seeds the static entries and runs the aggregator
    ///
    /// Seeding waits whenever the output is full. Returns early if the
    /// collector is closed meanwhile.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Collector already started");
            return;
        }

        let (intake_tx, intake_rx, output_tx) = {
            let mut runtime = self.runtime.lock();
            (
                runtime.intake_tx.clone(),
                runtime.intake_rx.take(),
                runtime.output_tx.clone(),
            )
        };
        let (Some(intake_tx), Some(intake_rx), Some(output_tx)) = (intake_tx, intake_rx, output_tx)
        else {
            warn!("Collector closed before start");
            return;
        };

        for handler in &self.handlers {
            let interface = &handler.network.interface.name;

            handler.watcher.add_notification_channel(intake_tx.clone());
            self.spawn_watcher(handler);

            if !self.emit(&output_tx, handler.self_message()).await {
                return;
            }
            debug!(interface = %interface, ip = %handler.network.host_ip(), "Seeded self entry");

            let gateway = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                gateway = handler.gateway_message() => gateway,
            };
            match gateway {
                Some(Ok(msg)) => {
                    let mac = msg.entry.mac;
                    if !self.emit(&output_tx, msg).await {
                        return;
                    }
                    debug!(interface = %interface, mac = %mac, "Seeded gateway entry");
                }
                Some(Err(e)) => {
                    self.metrics.gateway_lookup_failures_total.inc();
                    debug!(interface = %interface, error = %e, "Gateway lookup failed, skipping");
                }
                None => debug!(interface = %interface, "No gateway to seed"),
            }
        }
        drop(intake_tx);

        let mut runtime = self.runtime.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        runtime.aggregator = Some(tokio::spawn(aggregate(
            intake_rx,
            output_tx,
            self.cancel.clone(),
            self.metrics.clone(),
        )));
        info!(networks = self.handlers.len(), "Collector started");
    }

    /// Stops every watcher, then closes the intake and the output
    ///
    /// Idempotent. Once this returns the cache stream yields nothing more.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing collector");

        self.cancel.cancel();
        for handler in &self.handlers {
            handler.watcher.stop();
        }

        let tasks = std::mem::take(&mut self.runtime.lock().watcher_tasks);
        for task in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(WATCHER_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Watcher task ended abnormally"),
                Err(_) => {
                    warn!("Watcher ignored stop, aborting its task");
                    abort.abort();
                }
            }
        }

        let aggregator = {
            let mut runtime = self.runtime.lock();
            runtime.intake_tx.take();
            runtime.intake_rx.take();
            runtime.aggregator.take()
        };
        if let Some(aggregator) = aggregator {
            if let Err(e) = aggregator.await {
                warn!(error = %e, "Aggregator ended abnormally");
            }
        }

        self.runtime.lock().output_tx.take();
        info!("Collector closed");
    }

    fn spawn_watcher(&self, handler: &HandlerSet) {
        let watcher = Arc::clone(&handler.watcher);
        let cancel = self.cancel.clone();
        let metrics = self.metrics.clone();
        let interface = handler.network.interface.name.clone();

        let mut runtime = self.runtime.lock();
        if cancel.is_cancelled() {
            return;
        }
        runtime.watcher_tasks.push(tokio::spawn(async move {
            metrics.watchers_running.inc();
            debug!(interface = %interface, "Watcher listening");
            watcher.listen_and_serve(cancel).await;
            metrics.watchers_running.dec();
            debug!(interface = %interface, "Watcher finished");
        }));
    }

    /// Sends one static message; false once the collector is closing
    async fn emit(&self, output: &mpsc::Sender<CacheMessage>, msg: CacheMessage) -> bool {
        let sent = send_or_cancel(output, msg, &self.cancel).await;
        if sent {
            self.metrics.static_messages_total.inc();
        }
        sent
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.cancel.cancel();
            for handler in &self.handlers {
                handler.watcher.stop();
            }
        }
    }
}

/// Forwards online notifications as dynamic messages until the intake closes
async fn aggregate(
    mut intake: mpsc::Receiver<NeighborEntry>,
    output: mpsc::Sender<CacheMessage>,
    cancel: CancellationToken,
    metrics: CollectorMetrics,
) {
    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = intake.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        if !entry.online {
            metrics.offline_dropped_total.inc();
            debug!(mac = %entry.mac, "Dropping offline notification");
            continue;
        }
        if entry.mac.is_zero() {
            debug!("Dropping notification without MAC");
            continue;
        }

        if !send_or_cancel(&output, CacheMessage::dynamic(entry), &cancel).await {
            break;
        }
        metrics.dynamic_messages_total.inc();
    }
    debug!("Aggregator stopped");
}

/// Waits for room in `tx`; false if cancelled first or the receiver is gone
async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, msg: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(msg) => res.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerator::MockNetworkEnumerator;
    use crate::types::InterfaceInfo;
    use arp_types::MacAddress;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    const GATEWAY_MAC: MacAddress = MacAddress::new([0x00, 0x1d, 0xaa, 0x00, 0x00, 0x01]);
    const PEER_MAC: MacAddress = MacAddress::new([0x3c, 0x22, 0xfb, 0x10, 0x20, 0x30]);

    #[derive(Default)]
    struct FakeWatcher {
        gateway: Option<NeighborEntry>,
        senders: Mutex<Vec<mpsc::Sender<NeighborEntry>>>,
        stopped: CancellationToken,
        stop_calls: AtomicUsize,
    }

    impl FakeWatcher {
        async fn notify(&self, entry: NeighborEntry) {
            let senders = self.senders.lock().clone();
            for tx in senders {
                let _ = tx.send(entry.clone()).await;
            }
        }

        fn stop_calls(&self) -> usize {
            self.stop_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NeighborWatcher for FakeWatcher {
        fn add_notification_channel(&self, tx: mpsc::Sender<NeighborEntry>) {
            self.senders.lock().push(tx);
        }

        async fn listen_and_serve(&self, cancel: CancellationToken) {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.stopped.cancelled() => {}
            }
        }

        async fn who_is(&self, ip: Ipv4Addr) -> Result<NeighborEntry> {
            self.gateway.clone().ok_or(CollectorError::Lookup {
                ip,
                reason: "no reply".to_string(),
            })
        }

        fn stop(&self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.stopped.cancel();
            self.senders.lock().clear();
        }
    }

    /// Builds fake watchers; gateways listed in `resolvable` answer lookups
    #[derive(Default)]
    struct FakeBuilder {
        resolvable: HashMap<Ipv4Addr, MacAddress>,
        fail_on: Option<String>,
        built: Mutex<Vec<Arc<FakeWatcher>>>,
    }

    impl FakeBuilder {
        fn watcher(&self, index: usize) -> Arc<FakeWatcher> {
            Arc::clone(&self.built.lock()[index])
        }
    }

    impl WatcherBuilder for FakeBuilder {
        fn build(
            &self,
            network: &NetworkTuple,
            _settings: WatcherSettings,
        ) -> Result<Arc<dyn NeighborWatcher>> {
            if self.fail_on.as_deref() == Some(network.interface.name.as_str()) {
                return Err(CollectorError::Netlink("permission denied".to_string()));
            }
            let gateway = network.gateway.and_then(|gw| {
                self.resolvable
                    .get(&gw)
                    .map(|mac| NeighborEntry::observed(*mac, gw, true))
            });
            let watcher = Arc::new(FakeWatcher {
                gateway,
                ..FakeWatcher::default()
            });
            self.built.lock().push(Arc::clone(&watcher));
            Ok(watcher)
        }
    }

    fn network(name: &str, index: u8, gateway: bool) -> NetworkTuple {
        NetworkTuple {
            interface: InterfaceInfo {
                name: name.to_string(),
                index: u32::from(index),
                mac: MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, index]),
            },
            network: format!("10.{index}.0.10/24").parse().unwrap(),
            gateway: gateway.then(|| Ipv4Addr::new(10, index, 0, 1)),
        }
    }

    fn enumerator(networks: Vec<NetworkTuple>) -> MockNetworkEnumerator {
        let mut mock = MockNetworkEnumerator::new();
        mock.expect_discover()
            .times(1)
            .returning(move |_| Ok(networks.clone()));
        mock
    }

    fn config(capacity: usize) -> ArpConfig {
        ArpConfig {
            channel_capacity: capacity,
            ..ArpConfig::default()
        }
    }

    async fn next(stream: &mut CacheStream) -> CacheMessage {
        timeout(Duration::from_secs(1), stream.recv())
            .await
            .expect("message within timeout")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_gateway_resolved_seeds_two_static_entries() {
        let builder = FakeBuilder {
            resolvable: HashMap::from([(Ipv4Addr::new(10, 1, 0, 1), GATEWAY_MAC)]),
            ..FakeBuilder::default()
        };
        let collector =
            Collector::new(&config(16), &enumerator(vec![network("eth0", 1, true)]), &builder)
                .unwrap();
        let mut stream = collector.take_cache_stream().unwrap();

        collector.start().await;

        let own = next(&mut stream).await;
        assert!(own.is_static);
        assert_eq!(own.entry.mac, MacAddress::new([0x02, 0, 0, 0, 0, 1]));
        assert_eq!(own.entry.ips.len(), 1);
        assert_eq!(own.entry.ips[0].ip, Ipv4Addr::new(10, 1, 0, 10));
        assert!(own.entry.ips[0].last_updated.timestamp() > 0);

        let gateway = next(&mut stream).await;
        assert!(gateway.is_static);
        assert_eq!(gateway.entry.mac, GATEWAY_MAC);

        builder
            .watcher(0)
            .notify(NeighborEntry::observed(PEER_MAC, Ipv4Addr::new(10, 1, 0, 42), true))
            .await;
        let dynamic = next(&mut stream).await;
        assert!(!dynamic.is_static);
        assert_eq!(dynamic.entry.mac, PEER_MAC);

        assert_eq!(collector.metrics().static_messages_total.get(), 2);
        collector.close().await;
    }

    #[tokio::test]
    async fn test_gateway_failure_seeds_only_self() {
        let builder = FakeBuilder::default();
        let collector =
            Collector::new(&config(16), &enumerator(vec![network("eth0", 1, true)]), &builder)
                .unwrap();
        let mut stream = collector.take_cache_stream().unwrap();

        collector.start().await;
        builder
            .watcher(0)
            .notify(NeighborEntry::observed(PEER_MAC, Ipv4Addr::new(10, 1, 0, 42), true))
            .await;

        assert!(next(&mut stream).await.is_static);
        assert!(!next(&mut stream).await.is_static);
        assert_eq!(collector.metrics().gateway_lookup_failures_total.get(), 1);
        collector.close().await;
    }

    #[tokio::test]
    async fn test_static_count_between_n_and_2n() {
        let builder = FakeBuilder {
            resolvable: HashMap::from([
                (Ipv4Addr::new(10, 1, 0, 1), GATEWAY_MAC),
                (Ipv4Addr::new(10, 3, 0, 1), GATEWAY_MAC),
            ]),
            ..FakeBuilder::default()
        };
        let networks = vec![
            network("eth0", 1, true),
            network("eth1", 2, true),
            network("wlan0", 3, true),
        ];
        let collector = Collector::new(&config(16), &enumerator(networks), &builder).unwrap();
        let mut stream = collector.take_cache_stream().unwrap();

        collector.start().await;

        let mut statics = Vec::new();
        for _ in 0..5 {
            statics.push(next(&mut stream).await);
        }
        assert!(statics.iter().all(|m| m.is_static));
        assert!(statics.iter().all(|m| !m.entry.mac.is_zero() && !m.entry.ips.is_empty()));
        assert_eq!(collector.metrics().static_messages_total.get(), 5);
        collector.close().await;
    }

    #[tokio::test]
    async fn test_offline_entries_are_never_forwarded() {
        let builder = FakeBuilder::default();
        let collector =
            Collector::new(&config(16), &enumerator(vec![network("eth0", 1, false)]), &builder)
                .unwrap();
        let mut stream = collector.take_cache_stream().unwrap();
        collector.start().await;
        assert!(next(&mut stream).await.is_static);

        let watcher = builder.watcher(0);
        let peer_ip = Ipv4Addr::new(10, 1, 0, 42);
        watcher.notify(NeighborEntry::observed(PEER_MAC, peer_ip, false)).await;
        watcher.notify(NeighborEntry::observed(GATEWAY_MAC, peer_ip, true)).await;

        let msg = next(&mut stream).await;
        assert!(msg.entry.online);
        assert_eq!(msg.entry.mac, GATEWAY_MAC);
        assert_eq!(collector.metrics().offline_dropped_total.get(), 1);
        collector.close().await;
    }

    #[tokio::test]
    async fn test_zero_mac_gateway_seeds_only_self() {
        let builder = FakeBuilder {
            resolvable: HashMap::from([(Ipv4Addr::new(10, 1, 0, 1), MacAddress::ZERO)]),
            ..FakeBuilder::default()
        };
        let collector =
            Collector::new(&config(16), &enumerator(vec![network("eth0", 1, true)]), &builder)
                .unwrap();
        let mut stream = collector.take_cache_stream().unwrap();

        collector.start().await;
        builder
            .watcher(0)
            .notify(NeighborEntry::observed(PEER_MAC, Ipv4Addr::new(10, 1, 0, 42), true))
            .await;

        let own = next(&mut stream).await;
        assert!(own.is_static);
        assert_eq!(own.entry.mac, MacAddress::new([0x02, 0, 0, 0, 0, 1]));
        let dynamic = next(&mut stream).await;
        assert!(!dynamic.is_static);
        assert_eq!(dynamic.entry.mac, PEER_MAC);

        assert_eq!(collector.metrics().static_messages_total.get(), 1);
        assert_eq!(collector.metrics().gateway_lookup_failures_total.get(), 1);
        collector.close().await;
    }

    #[tokio::test]
    async fn test_zero_mac_notifications_are_dropped() {
        let builder = FakeBuilder::default();
        let collector =
            Collector::new(&config(16), &enumerator(vec![network("eth0", 1, false)]), &builder)
                .unwrap();
        let mut stream = collector.take_cache_stream().unwrap();
        collector.start().await;
        assert!(next(&mut stream).await.is_static);

        let watcher = builder.watcher(0);
        let peer_ip = Ipv4Addr::new(10, 1, 0, 42);
        watcher.notify(NeighborEntry::observed(MacAddress::ZERO, peer_ip, true)).await;
        watcher.notify(NeighborEntry::observed(PEER_MAC, peer_ip, true)).await;

        let msg = next(&mut stream).await;
        assert!(!msg.is_static);
        assert_eq!(msg.entry.mac, PEER_MAC);
        assert_eq!(collector.metrics().dynamic_messages_total.get(), 1);
        assert_eq!(collector.metrics().offline_dropped_total.get(), 0);
        collector.close().await;
    }

    #[tokio::test]
    async fn test_construction_failure_releases_built_watchers() {
        let builder = FakeBuilder {
            fail_on: Some("eth1".to_string()),
            ..FakeBuilder::default()
        };
        let networks = vec![network("eth0", 1, true), network("eth1", 2, true)];

        let err = Collector::new(&config(16), &enumerator(networks), &builder)
            .err()
            .expect("construction must fail");

        match err {
            CollectorError::Construction { interface, .. } => assert_eq!(interface, "eth1"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builder.built.lock().len(), 1);
        assert_eq!(builder.watcher(0).stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_returned() {
        let mut mock = MockNetworkEnumerator::new();
        mock.expect_discover()
            .returning(|_| Err(CollectorError::Discovery("no interfaces".to_string())));

        let result = Collector::new(&config(16), &mock, &FakeBuilder::default());
        assert!(matches!(result, Err(CollectorError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_subnet_filter_is_passed_to_enumerator() {
        let filter: arp_types::Ipv4Network = "10.1.0.0/16".parse().unwrap();
        let expected = filter;
        let mut mock = MockNetworkEnumerator::new();
        mock.expect_discover()
            .withf(move |filters| filters.len() == 1 && filters[0] == expected)
            .times(1)
            .returning(|_| Ok(Vec::new()));

        let config = ArpConfig {
            subnets: vec![filter],
            ..ArpConfig::default()
        };
        let collector = Collector::new(&config, &mock, &FakeBuilder::default()).unwrap();
        assert_eq!(collector.networks().count(), 0);
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let builder = FakeBuilder::default();
        let networks = vec![network("eth0", 1, false), network("eth1", 2, false)];
        let collector = Collector::new(&config(16), &enumerator(networks), &builder).unwrap();
        let mut stream = collector.take_cache_stream().unwrap();
        collector.start().await;

        collector.close().await;
        collector.close().await;

        assert_eq!(builder.watcher(0).stop_calls(), 1);
        assert_eq!(builder.watcher(1).stop_calls(), 1);
        assert_eq!(collector.metrics().watchers_running.get(), 0.0);

        builder
            .watcher(0)
            .notify(NeighborEntry::observed(PEER_MAC, Ipv4Addr::new(10, 1, 0, 42), true))
            .await;
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_output_backpressure_blocks_seeding() {
        let builder = FakeBuilder::default();
        let networks = vec![network("eth0", 1, false), network("eth1", 2, false)];
        let collector =
            Arc::new(Collector::new(&config(1), &enumerator(networks), &builder).unwrap());
        let mut stream = collector.take_cache_stream().unwrap();

        let starter = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.start().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!starter.is_finished(), "second self entry must wait for room");

        let first = next(&mut stream).await;
        assert_eq!(first.entry.ips[0].ip, Ipv4Addr::new(10, 1, 0, 10));
        timeout(Duration::from_secs(1), starter)
            .await
            .expect("start finishes once drained")
            .unwrap();
        let second = next(&mut stream).await;
        assert_eq!(second.entry.ips[0].ip, Ipv4Addr::new(10, 2, 0, 10));

        collector.close().await;
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_start() {
        let builder = FakeBuilder::default();
        let networks = vec![network("eth0", 1, false), network("eth1", 2, false)];
        let collector =
            Arc::new(Collector::new(&config(1), &enumerator(networks), &builder).unwrap());
        let _stream = collector.take_cache_stream().unwrap();

        let starter = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        collector.close().await;
        timeout(Duration::from_secs(1), starter)
            .await
            .expect("start returns after close")
            .unwrap();
        assert_eq!(builder.watcher(0).stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let builder = FakeBuilder::default();
        let collector =
            Collector::new(&config(16), &enumerator(vec![network("eth0", 1, false)]), &builder)
                .unwrap();
        let mut stream = collector.take_cache_stream().unwrap();

        collector.start().await;
        collector.start().await;

        assert!(next(&mut stream).await.is_static);
        assert_eq!(collector.metrics().static_messages_total.get(), 1);
        assert!(collector.take_cache_stream().is_none());
        collector.close().await;
    }
}
