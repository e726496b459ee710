//! Kernel-backed neighbor watcher
//!
//! Follows the kernel ARP table over rtnetlink and keeps it fresh by
//! provoking ARP requests: an empty UDP datagram to an address the kernel
//! has no usable neighbor entry for makes it resolve the MAC first.

use crate::error::{CollectorError, Result};
use crate::netlink::{AsyncNetlinkSocket, NeighborEvent, NeighborEventKind, NeighborState};
use crate::types::{NeighborEntry, NetworkTuple};
use crate::watcher::{NeighborWatcher, WatcherBuilder, WatcherSettings};
use arp_types::MacAddress;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// How long `who_is` waits for the kernel to resolve an address
const WHO_IS_TIMEOUT: Duration = Duration::from_secs(2);

/// Table poll period while `who_is` waits
const WHO_IS_POLL: Duration = Duration::from_millis(100);

/// Discard service; nothing needs to listen there
const PROBE_PORT: u16 = 9;

/// Probes sent before yielding back to the runtime during a full scan
const PROBE_BATCH: usize = 256;

#[derive(Debug, Clone)]
struct Tracked {
    entry: NeighborEntry,
    /// Last NUD state reported by the kernel
    state: NeighborState,
    /// Last time the kernel confirmed the neighbor answers
    confirmed: Instant,
    /// Last time the entry was handed to the notification channels
    announced: Instant,
}

/// States in which the kernel has recently heard from the neighbor.
/// STALE, DELAY and PROBE only mean a MAC is cached.
fn confirms(state: NeighborState) -> bool {
    matches!(state, NeighborState::Reachable | NeighborState::Permanent)
}

/// Neighbors of one network, keyed by MAC
#[derive(Debug)]
pub struct NeighborTable {
    ifindex: u32,
    network: NetworkTuple,
    by_mac: HashMap<MacAddress, Tracked>,
}

impl NeighborTable {
    pub fn new(network: NetworkTuple) -> Self {
        Self {
            ifindex: network.interface.index,
            network,
            by_mac: HashMap::new(),
        }
    }

    /// Applies one kernel event
    ///
    /// Returns the entry when its presence changed or it gained a new IP.
    /// Only a first sighting, a new IP or a REACHABLE/PERMANENT report
    /// counts as confirmation; a cached STALE entry ages out and stays
    /// offline once expired.
    pub fn apply(&mut self, event: &NeighborEvent, now: Instant) -> Option<NeighborEntry> {
        if event.ifindex != self.ifindex || !self.network.network.contains(event.ip) {
            return None;
        }

        if event.kind == NeighborEventKind::Delete || event.state.is_unreachable() {
            return self.mark_offline(event.mac, event.ip);
        }
        if !event.state.is_resolved() || !event.mac.is_usable() {
            return None;
        }

        let first_sighting = !self.by_mac.contains_key(&event.mac);
        let tracked = self.by_mac.entry(event.mac).or_insert_with(|| Tracked {
            entry: NeighborEntry::observed(event.mac, event.ip, false),
            state: event.state,
            confirmed: now,
            announced: now,
        });
        let new_ip = !tracked.entry.has_ip(event.ip);
        tracked.state = event.state;

        if !(first_sighting || new_ip || confirms(event.state)) {
            return None;
        }
        let changed = first_sighting || new_ip || !tracked.entry.online;
        tracked.entry.touch(event.ip, Utc::now());
        tracked.entry.online = true;
        tracked.confirmed = now;
        if changed {
            tracked.announced = now;
        }

        changed.then(|| tracked.entry.clone())
    }

    fn mark_offline(&mut self, mac: MacAddress, ip: Ipv4Addr) -> Option<NeighborEntry> {
        let tracked = if mac.is_zero() {
            self.by_mac.values_mut().find(|t| t.entry.has_ip(ip))?
        } else {
            self.by_mac.get_mut(&mac)?
        };
        if !tracked.entry.online {
            return None;
        }
        tracked.entry.online = false;
        Some(tracked.entry.clone())
    }

    /// Marks offline every neighbor not confirmed within `deadline`
    pub fn expire(&mut self, deadline: Duration, now: Instant) -> Vec<NeighborEntry> {
        self.by_mac
            .values_mut()
            .filter(|t| t.entry.online && now.duration_since(t.confirmed) >= deadline)
            .map(|t| {
                t.entry.online = false;
                t.announced = now;
                t.entry.clone()
            })
            .collect()
    }

    /// Online neighbors confirmed since they were last announced
    ///
    /// Each is returned once per confirmation so downstream caches can
    /// extend their expiry.
    pub fn renewals(&mut self, now: Instant) -> Vec<NeighborEntry> {
        self.by_mac
            .values_mut()
            .filter(|t| t.entry.online && t.confirmed > t.announced)
            .map(|t| {
                t.announced = now;
                t.entry.clone()
            })
            .collect()
    }

    /// Online neighbor currently bound to `ip`
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<NeighborEntry> {
        self.by_mac
            .values()
            .find(|t| t.entry.online && t.entry.has_ip(ip))
            .map(|t| t.entry.clone())
    }

    /// Most recent IP of every neighbor not confirmed within `age`
    pub fn stale_ips(&self, age: Duration, now: Instant) -> Vec<Ipv4Addr> {
        self.by_mac
            .values()
            .filter(|t| t.state != NeighborState::Permanent)
            .filter(|t| now.duration_since(t.confirmed) >= age)
            .filter_map(|t| t.entry.ips.first().map(|obs| obs.ip))
            .collect()
    }

    fn len(&self) -> usize {
        self.by_mac.len()
    }
}

/// Watches one network through the kernel neighbor table
///
/// Table updates never wait on consumers: changes are coalesced per MAC in
/// `pending` and delivered by a separate forwarding loop.
pub struct KernelNeighborWatcher {
    network: NetworkTuple,
    settings: WatcherSettings,
    /// Taken by `listen_and_serve`, dropped by `stop`
    socket: Mutex<Option<AsyncNetlinkSocket>>,
    table: Mutex<NeighborTable>,
    pending: Mutex<HashMap<MacAddress, NeighborEntry>>,
    pending_ready: Notify,
    channels: Mutex<Vec<mpsc::Sender<NeighborEntry>>>,
    stopped: CancellationToken,
}

impl KernelNeighborWatcher {
    /// Opens the netlink socket; must be called within a tokio runtime
    ///
    /// # Errors
    ///
    /// [`CollectorError::Construction`] when the socket cannot be opened.
    #[instrument(skip_all, fields(interface = %network.interface.name))]
    pub fn new(network: NetworkTuple, settings: WatcherSettings) -> Result<Self> {
        let socket = AsyncNetlinkSocket::new().map_err(|e| CollectorError::Construction {
            interface: network.interface.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::with_socket(network, settings, Some(socket)))
    }

    fn with_socket(
        network: NetworkTuple,
        settings: WatcherSettings,
        socket: Option<AsyncNetlinkSocket>,
    ) -> Self {
        Self {
            table: Mutex::new(NeighborTable::new(network.clone())),
            network,
            settings,
            socket: Mutex::new(socket),
            pending: Mutex::new(HashMap::new()),
            pending_ready: Notify::new(),
            channels: Mutex::new(Vec::new()),
            stopped: CancellationToken::new(),
        }
    }

    fn interface(&self) -> &str {
        &self.network.interface.name
    }

    fn handle_events(&self, events: &[NeighborEvent]) {
        let now = Instant::now();
        let changed: Vec<NeighborEntry> = {
            let mut table = self.table.lock();
            events.iter().filter_map(|e| table.apply(e, now)).collect()
        };
        self.enqueue(changed);
    }

    /// Queues entries for delivery; a newer entry replaces a queued one
    /// for the same MAC
    fn enqueue(&self, entries: Vec<NeighborEntry>) {
        if entries.is_empty() {
            return;
        }
        if self.settings.debug {
            for entry in &entries {
                debug!(
                    interface = %self.interface(),
                    mac = %entry.mac,
                    ip = ?entry.ips.first().map(|o| o.ip),
                    online = entry.online,
                    "Neighbor changed"
                );
            }
        }

        let mut pending = self.pending.lock();
        for entry in entries {
            pending.insert(entry.mac, entry);
        }
        drop(pending);
        self.pending_ready.notify_one();
    }

    /// Drains queued entries into every registered channel until cancelled
    async fn forward_notifications(&self, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.stopped.cancelled() => return,
                _ = self.pending_ready.notified() => {}
            }

            let batch: Vec<NeighborEntry> =
                self.pending.lock().drain().map(|(_, entry)| entry).collect();
            for entry in batch {
                if !self.deliver(entry, cancel).await {
                    return;
                }
            }
        }
    }

    /// Returns false once cancelled or stopped
    async fn deliver(&self, entry: NeighborEntry, cancel: &CancellationToken) -> bool {
        let channels = self.channels.lock().clone();
        for tx in channels {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = self.stopped.cancelled() => return false,
                res = tx.send(entry.clone()) => {
                    if res.is_err() {
                        trace!(interface = %self.interface(), "Notification channel closed");
                    }
                }
            }
        }
        true
    }

    /// Sends one empty datagram to each target through this network
    async fn probe(&self, targets: &[Ipv4Addr]) {
        if targets.is_empty() {
            return;
        }
        let socket = match UdpSocket::bind(SocketAddrV4::new(self.network.host_ip(), 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(interface = %self.interface(), error = %e, "Failed to open probe socket");
                return;
            }
        };

        for (i, ip) in targets.iter().enumerate() {
            if let Err(e) = socket.send_to(&[], SocketAddrV4::new(*ip, PROBE_PORT)).await {
                trace!(ip = %ip, error = %e, "Probe failed");
            }
            if (i + 1) % PROBE_BATCH == 0 {
                tokio::task::yield_now().await;
            }
        }
        if self.settings.debug {
            debug!(interface = %self.interface(), count = targets.len(), "Sent probes");
        }
    }

    /// Expires silent neighbors, renews confirmed ones, reprobes the
    /// unconfirmed and requests a fresh dump
    async fn refresh(&self, socket: &mut AsyncNetlinkSocket) {
        let now = Instant::now();
        let (mut changed, stale) = {
            let mut table = self.table.lock();
            let expired = table.expire(self.settings.offline_deadline, now);
            let mut changed = table.renewals(now);
            changed.extend(expired);
            (changed, table.stale_ips(self.settings.probe_interval, now))
        };
        self.enqueue(changed);
        self.probe(&stale).await;
        if let Err(e) = socket.request_dump() {
            warn!(interface = %self.interface(), error = %e, "Neighbor dump request failed");
        }
    }

    async fn full_scan(&self) {
        let own = self.network.host_ip();
        let targets: Vec<Ipv4Addr> = self
            .network
            .network
            .hosts()
            .filter(|ip| *ip != own)
            .collect();
        self.probe(&targets).await;
    }

    async fn serve_events(&self, mut socket: AsyncNetlinkSocket, cancel: &CancellationToken) {
        if let Err(e) = socket.request_dump() {
            warn!(error = %e, "Initial neighbor dump request failed");
        }
        info!(network = %self.network.network, "Watching neighbors");

        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.probe_interval,
            self.settings.probe_interval,
        );
        let mut scan = tokio::time::interval(self.settings.full_scan_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.stopped.cancelled() => break,
                events = socket.recv_events() => match events {
                    Ok(events) => self.handle_events(&events),
                    Err(e) => warn!(error = %e, "Failed to receive neighbor events"),
                },
                _ = refresh.tick() => self.refresh(&mut socket).await,
                _ = scan.tick() => self.full_scan().await,
            }
        }
    }
}

#[async_trait]
impl NeighborWatcher for KernelNeighborWatcher {
    fn add_notification_channel(&self, tx: mpsc::Sender<NeighborEntry>) {
        if self.stopped.is_cancelled() {
            return;
        }
        self.channels.lock().push(tx);
    }

    #[instrument(skip_all, fields(interface = %self.network.interface.name))]
    async fn listen_and_serve(&self, cancel: CancellationToken) {
        let Some(socket) = self.socket.lock().take() else {
            warn!("Watcher already serving or stopped");
            return;
        };

        tokio::join!(
            self.forward_notifications(&cancel),
            self.serve_events(socket, &cancel)
        );

        debug!(neighbors = self.table.lock().len(), "Watcher stopped");
    }

    #[instrument(skip(self), fields(interface = %self.network.interface.name))]
    async fn who_is(&self, ip: Ipv4Addr) -> Result<NeighborEntry> {
        if let Some(entry) = self.table.lock().lookup(ip) {
            return Ok(entry);
        }
        self.probe(&[ip]).await;

        let deadline = tokio::time::Instant::now() + WHO_IS_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.stopped.is_cancelled() {
                break;
            }
            tokio::time::sleep(WHO_IS_POLL).await;
            if let Some(entry) = self.table.lock().lookup(ip) {
                return Ok(entry);
            }
        }

        Err(CollectorError::Lookup {
            ip,
            reason: format!("no reply within {:?}", WHO_IS_TIMEOUT),
        })
    }

    fn stop(&self) {
        self.stopped.cancel();
        self.channels.lock().clear();
        self.pending.lock().clear();
        self.socket.lock().take();
    }
}

/// Builds a [`KernelNeighborWatcher`] per network
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelWatcherBuilder;

impl WatcherBuilder for KernelWatcherBuilder {
    fn build(
        &self,
        network: &NetworkTuple,
        settings: WatcherSettings,
    ) -> Result<Arc<dyn NeighborWatcher>> {
        Ok(Arc::new(KernelNeighborWatcher::new(network.clone(), settings)?))
    }
}
