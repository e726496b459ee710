//! Per-network neighbor watcher abstraction
//!
//! A watcher owns the discovery protocol for exactly one local network. The
//! collector only relies on the contract below; the kernel-backed
//! implementation lives in [`crate::kernel_watcher`].

use crate::config::ArpConfig;
use crate::error::Result;
use crate::types::{NeighborEntry, NetworkTuple};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Timing and verbosity handed to every watcher at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    pub probe_interval: Duration,
    pub full_scan_interval: Duration,
    pub offline_deadline: Duration,
    /// Log protocol-level activity at debug level
    pub debug: bool,
}

impl From<&ArpConfig> for WatcherSettings {
    fn from(config: &ArpConfig) -> Self {
        Self {
            probe_interval: config.probe_interval(),
            full_scan_interval: config.full_scan_interval(),
            offline_deadline: config.offline_deadline(),
            debug: config.verbose,
        }
    }
}

/// Neighbor discovery for one network
///
/// Several watchers may be registered with clones of the same sender, which
/// is how the collector fans every network into one intake.
#[async_trait]
pub trait NeighborWatcher: Send + Sync + 'static {
    /// Registers a channel that receives every presence change.
    fn add_notification_channel(&self, tx: mpsc::Sender<NeighborEntry>);

    /// Monitors the network until `cancel` fires or [`NeighborWatcher::stop`]
    /// is called.
    async fn listen_and_serve(&self, cancel: CancellationToken);

    /// Resolves the MAC currently bound to `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CollectorError::Lookup`] when nothing answers within
    /// the watcher's timeout.
    async fn who_is(&self, ip: Ipv4Addr) -> Result<NeighborEntry>;

    /// Releases every resource and drops all registered channels.
    ///
    /// Idempotent. No notification is written after this returns.
    fn stop(&self);
}

/// Builds the watcher for one discovered network
pub trait WatcherBuilder: Send + Sync {
    /// # Errors
    ///
    /// Returns [`crate::CollectorError::Construction`] when the network cannot
    /// be monitored.
    fn build(
        &self,
        network: &NetworkTuple,
        settings: WatcherSettings,
    ) -> Result<Arc<dyn NeighborWatcher>>;
}
