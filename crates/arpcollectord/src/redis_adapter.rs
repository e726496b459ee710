//! Redis cache writer
//!
//! Every IP of a cache message becomes one hash `{prefix}:{ip}` holding the
//! MAC, the observation time and whether the entry is static. Dynamic keys
//! expire; static ones are persisted.

use crate::collector::CacheStream;
use crate::config::RedisConfig;
use crate::error::Result;
use crate::types::{CacheMessage, IpObservation};
use async_trait::async_trait;
use redis::Client;
use redis::aio::ConnectionManager;
use std::net::Ipv4Addr;
use tracing::{debug, info, instrument, warn};

/// Destination of the collector's output
#[async_trait]
pub trait CacheWriter: Send {
    async fn write(&mut self, msg: &CacheMessage) -> Result<()>;
}

/// Key of the hash holding one IP's binding
pub fn cache_key(prefix: &str, ip: Ipv4Addr) -> String {
    format!("{}:{}", prefix, ip)
}

/// Hash fields written for one observation
pub fn hash_fields(msg: &CacheMessage, obs: &IpObservation) -> [(&'static str, String); 3] {
    [
        ("mac", msg.entry.mac.to_string()),
        ("updated", obs.last_updated.to_rfc3339()),
        ("static", msg.is_static.to_string()),
    ]
}

/// Writes cache messages to Redis
pub struct RedisCacheWriter {
    conn: ConnectionManager,
    key_prefix: String,
    dynamic_ttl_secs: u64,
}

impl RedisCacheWriter {
    /// Connects to the configured database
    #[instrument(skip_all, fields(host = %config.host, port = config.port, db = config.db))]
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url())?;
        let conn = ConnectionManager::new(client).await?;

        debug!("Connected to Redis");
        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            dynamic_ttl_secs: config.dynamic_ttl_secs,
        })
    }
}

#[async_trait]
impl CacheWriter for RedisCacheWriter {
    #[instrument(skip_all, fields(mac = %msg.entry.mac, is_static = msg.is_static))]
    async fn write(&mut self, msg: &CacheMessage) -> Result<()> {
        if msg.entry.ips.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for obs in &msg.entry.ips {
            let key = cache_key(&self.key_prefix, obs.ip);
            pipe.hset_multiple(&key, &hash_fields(msg, obs)).ignore();
            if msg.is_static {
                pipe.persist(&key).ignore();
            } else {
                pipe.expire(&key, self.dynamic_ttl_secs as i64).ignore();
            }
        }

        let _: () = pipe.query_async(&mut self.conn).await?;
        debug!(keys = msg.entry.ips.len(), "Wrote cache entry");
        Ok(())
    }
}

/// Drains `stream` into `writer` until the collector closes
///
/// Write failures are logged and skipped. Returns the number of messages
/// written.
pub async fn run_sink<W: CacheWriter>(mut stream: CacheStream, mut writer: W) -> u64 {
    let mut written = 0u64;
    while let Some(msg) = stream.recv().await {
        match writer.write(&msg).await {
            Ok(()) => written += 1,
            Err(e) => warn!(mac = %msg.entry.mac, error = %e, "Failed to write cache entry"),
        }
    }
    info!(written, "Cache sink stopped");
    written
}
