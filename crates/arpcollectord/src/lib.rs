//! Multi-interface ARP collector
//!
//! Watches the neighbors of every local IPv4 network and merges them into
//! one bounded stream of cache messages. The host itself and each network's
//! gateway are seeded as static entries; neighbors coming online are
//! forwarded as dynamic entries. The daemon writes the stream to Redis.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────┐     ┌──────────────┐
//! │  Linux Kernel   │     │      arpcollectord       │     │    Redis     │
//! │                 │     │                          │     │              │
//! │  ARP table      │────▶│  KernelNeighborWatcher   │     │  arc:<ip>    │
//! │  (per network)  │     │     (one per network)    │     │   mac        │
//! │                 │     │            │             │     │   updated    │
//! │  RTM_NEWNEIGH   │     │            ▼             │     │   static     │
//! │  RTM_DELNEIGH   │     │  Collector ──▶ CacheStream ───▶│              │
//! └─────────────────┘     └──────────────────────────┘     └──────────────┘
//! ```

pub mod collector;
pub mod config;
pub mod enumerator;
pub mod error;
pub mod kernel_watcher;
pub mod metrics;
pub mod netlink;
pub mod redis_adapter;
pub mod types;
pub mod watcher;

pub use collector::{CacheStream, Collector, HandlerSet};
pub use config::{ArpConfig, CollectordConfig, RedisConfig};
pub use enumerator::{NetworkEnumerator, SystemNetworkEnumerator};
pub use error::{CollectorError, Result};
pub use kernel_watcher::{KernelNeighborWatcher, KernelWatcherBuilder};
pub use metrics::CollectorMetrics;
pub use redis_adapter::{CacheWriter, RedisCacheWriter, run_sink};
pub use types::{CacheMessage, InterfaceInfo, IpObservation, NeighborEntry, NetworkTuple};
pub use watcher::{NeighborWatcher, WatcherBuilder, WatcherSettings};
