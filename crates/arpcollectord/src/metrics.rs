//! Prometheus metrics for the collector

use crate::error::Result;
use prometheus::{Gauge, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Counters shared by the seeder, the aggregator and the watcher tasks
#[derive(Clone)]
pub struct CollectorMetrics {
    pub static_messages_total: IntCounter,
    pub dynamic_messages_total: IntCounter,
    pub offline_dropped_total: IntCounter,
    pub gateway_lookup_failures_total: IntCounter,
    pub watchers_running: Gauge,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl CollectorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let static_messages_total = IntCounter::with_opts(Opts::new(
            "arpcollector_static_messages_total",
            "Static cache messages seeded for hosts and gateways",
        ))?;
        registry.register(Box::new(static_messages_total.clone()))?;

        let dynamic_messages_total = IntCounter::with_opts(Opts::new(
            "arpcollector_dynamic_messages_total",
            "Online neighbor notifications forwarded to the cache",
        ))?;
        registry.register(Box::new(dynamic_messages_total.clone()))?;

        let offline_dropped_total = IntCounter::with_opts(Opts::new(
            "arpcollector_offline_dropped_total",
            "Offline neighbor notifications discarded by the aggregator",
        ))?;
        registry.register(Box::new(offline_dropped_total.clone()))?;

        let gateway_lookup_failures_total = IntCounter::with_opts(Opts::new(
            "arpcollector_gateway_lookup_failures_total",
            "Gateway lookups that got no answer during seeding",
        ))?;
        registry.register(Box::new(gateway_lookup_failures_total.clone()))?;

        let watchers_running = Gauge::with_opts(Opts::new(
            "arpcollector_watchers_running",
            "Neighbor watchers currently listening",
        ))?;
        registry.register(Box::new(watchers_running.clone()))?;

        Ok(Self {
            static_messages_total,
            dynamic_messages_total,
            offline_dropped_total,
            gateway_lookup_failures_total,
            watchers_running,
            registry: Arc::new(registry),
        })
    }

    /// Renders every metric in the Prometheus text format
    pub fn gather_text(&self) -> String {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = CollectorMetrics::new().unwrap();
        assert_eq!(metrics.static_messages_total.get(), 0);
        assert_eq!(metrics.dynamic_messages_total.get(), 0);
        assert_eq!(metrics.watchers_running.get(), 0.0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = CollectorMetrics::new().unwrap();
        let clone = metrics.clone();
        clone.offline_dropped_total.inc();
        assert_eq!(metrics.offline_dropped_total.get(), 1);
    }

    #[test]
    fn test_gather_text() {
        let metrics = CollectorMetrics::new().unwrap();
        metrics.gateway_lookup_failures_total.inc();
        let text = metrics.gather_text();
        assert!(text.contains("arpcollector_gateway_lookup_failures_total 1"));
    }
}
