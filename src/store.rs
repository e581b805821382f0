// src/store.rs

//! The shared key-value store client (C1, §4.1): typed access to the
//! external Redis-protocol store, atomic multi-operation blocks, and
//! pub/sub. Every mutation path that changes shared state must publish an
//! invalidation message in the same logical operation — see
//! [`crate::pubsub`] for the channel names and [`Transaction`] for the
//! atomic helper used throughout the scanners, monitor, and admin surface.

use crate::error::{MirrorbitsError, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use std::collections::{HashMap, HashSet};
use tracing::{error, info};

/// Minimum store feature version this client requires. Mirrors the source
/// spec's "minimum store feature version is a configurable constant; the
/// client refuses to start otherwise".
pub const MIN_STORE_VERSION: &str = "6.2.0";

/// The well-known key holding the schema version (§6). A mismatch is fatal.
pub const SCHEMA_VERSION_KEY: &str = "MIRRORBITS_DB_VERSION";
pub const SCHEMA_VERSION: u32 = 1;

/// A connected client to the shared store, wrapping a pooled, multiplexed
/// Redis connection. Tolerates leader failover by going through
/// `redis::sentinel` when sentinels are configured.
#[derive(Clone)]
pub struct Store {
    manager: ConnectionManager,
    client: Client,
}

impl Store {
    /// Connects directly to a single Redis-protocol endpoint.
    pub async fn connect(address: &str, password: Option<&str>, db: i64) -> Result<Self> {
        let url = build_redis_url(address, password, db);
        let client = Client::open(url).map_err(MirrorbitsError::Store)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(MirrorbitsError::Store)?;
        let store = Self { manager, client };
        store.check_minimum_version().await?;
        store.check_schema_version().await?;
        Ok(store)
    }

    /// Resolves the current primary through a set of Sentinel instances
    /// before connecting, tolerating leader failover (§4.1).
    pub async fn connect_via_sentinel(
        sentinels: &[String],
        master_name: &str,
        password: Option<&str>,
        db: i64,
    ) -> Result<Self> {
        let mut sentinel = redis::sentinel::Sentinel::build(sentinels.to_vec())
            .map_err(MirrorbitsError::Store)?;
        let master_client = sentinel
            .master_for(master_name, None)
            .map_err(MirrorbitsError::Store)?;
        let address = master_client.get_connection_info().addr.to_string();
        info!(master = master_name, %address, "resolved primary via sentinel");
        Self::connect(&address, password, db).await
    }

    /// Fetches the store's server version via `INFO server` and refuses to
    /// start if it's older than [`MIN_STORE_VERSION`] (§4.1).
    async fn check_minimum_version(&self) -> Result<()> {
        let mut conn = self.conn();
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await?;
        let server_version = info
            .lines()
            .find_map(|line| line.strip_prefix("redis_version:"))
            .unwrap_or("0.0.0")
            .trim()
            .to_string();

        if version_less_than(&server_version, MIN_STORE_VERSION) {
            return Err(MirrorbitsError::PreconditionFailed(format!(
                "store reports version {server_version}, below the minimum supported {MIN_STORE_VERSION}"
            )));
        }
        info!(server_version, min_required = MIN_STORE_VERSION, "store version check passed");
        Ok(())
    }

    async fn check_schema_version(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let version: Option<u32> = conn.get(SCHEMA_VERSION_KEY).await?;
        match version {
            None => {
                let _: () = conn.set(SCHEMA_VERSION_KEY, SCHEMA_VERSION).await?;
                Ok(())
            }
            Some(v) if v == SCHEMA_VERSION => Ok(()),
            Some(v) => Err(MirrorbitsError::PreconditionFailed(format!(
                "store schema version mismatch: expected {SCHEMA_VERSION}, found {v}"
            ))),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    // -- Hash access ---------------------------------------------------

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    pub async fn hset_multiple(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        let pairs: Vec<(&String, &String)> = fields.iter().collect();
        let _: () = self.conn().hset_multiple(key, &pairs).await?;
        Ok(())
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let _: () = self.conn().hdel(key, field).await?;
        Ok(())
    }

    /// `HINCRBY key field delta`, as used by the request pipeline's
    /// per-bucket request/byte counters (§6 `STATS_*`).
    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        Ok(self.conn().hincr(key, field, delta).await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.conn().exists(key).await?)
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    /// Pushes `value` onto the front of the bounded list `key`, trimming it
    /// to `max_len` entries, as used by the per-mirror log (§6
    /// `MIRRORLOGS_<id>`).
    pub async fn lpush_bounded(&self, key: &str, value: &str, max_len: isize) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.lpush(key, value).await?;
        let _: () = conn.ltrim(key, 0, max_len - 1).await?;
        Ok(())
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.conn().lrange(key, start, stop).await?)
    }

    // -- Set access -----------------------------------------------------

    pub async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().sadd(key, member).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().srem(key, member).await?;
        Ok(())
    }

    /// `SDIFFSTORE dest a b`: writes `a \ b` into `dest`.
    pub async fn sdiffstore(&self, dest: &str, a: &str, b: &str) -> Result<()> {
        let _: () = self.conn().sdiffstore(dest, &[a, b]).await?;
        Ok(())
    }

    /// `SINTERSTORE dest a b`: writes `a ∩ b` into `dest`.
    pub async fn sinterstore(&self, dest: &str, a: &str, b: &str) -> Result<()> {
        let _: () = self.conn().sinterstore(dest, &[a, b]).await?;
        Ok(())
    }

    /// Atomically replaces `dest` with the contents of `src`, as used by the
    /// scanners' `FILES_TMP -> FILES` reconciliation step (§4.5 step 4).
    pub async fn rename(&self, src: &str, dest: &str) -> Result<()> {
        let _: () = self.conn().rename(src, dest).await?;
        Ok(())
    }

    // -- Counters & locks -------------------------------------------------

    pub async fn incr(&self, key: &str) -> Result<i64> {
        Ok(self.conn().incr(key, 1).await?)
    }

    /// `SET key val NX EX seconds`. Used by the cluster lock (C2).
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let result: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await;
        match result {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(MirrorbitsError::Store(e)),
        }
    }

    /// `EXPIRE key seconds`, returning whether the key still existed.
    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        Ok(self.conn().expire(key, ttl_secs as i64).await?)
    }

    // -- Pub/sub ----------------------------------------------------------

    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let _: i64 = self.conn().publish(channel, message).await?;
        Ok(())
    }

    /// Opens a dedicated pub/sub connection subscribed to the given
    /// channels. Pub/sub cannot multiplex over the pooled connection
    /// manager, so this opens its own connection, matching the spec's
    /// requirement for "blocking/non-blocking pub/sub subscription".
    pub async fn subscribe(&self, channels: &[&str]) -> Result<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(MirrorbitsError::Store)?;
        for channel in channels {
            pubsub
                .subscribe(*channel)
                .await
                .map_err(MirrorbitsError::Store)?;
        }
        Ok(pubsub)
    }

    /// Starts a new atomic multi-operation block (`MULTI`/`EXEC`). On any
    /// command failure inside the block, the whole block is discarded by
    /// the server — callers don't need to roll anything back manually.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            pipe: redis::pipe(),
        }
    }
}

fn build_redis_url(address: &str, password: Option<&str>, db: i64) -> String {
    match password {
        Some(pw) if !pw.is_empty() => format!("redis://:{pw}@{address}/{db}"),
        _ => format!("redis://{address}/{db}"),
    }
}

/// An atomic multi-operation block (§4.1). Commands are queued with the
/// builder methods and executed together with [`Transaction::commit`]; any
/// failure discards the whole block.
pub struct Transaction<'a> {
    store: &'a Store,
    pipe: redis::Pipeline,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a Store) -> Self {
        store.transaction()
    }

    pub fn hset_multiple(mut self, key: &str, fields: &HashMap<String, String>) -> Self {
        self.pipe
            .hset_multiple(key, &fields.iter().collect::<Vec<_>>());
        self
    }

    pub fn hset(mut self, key: &str, field: &str, value: &str) -> Self {
        self.pipe.hset(key, field, value);
        self
    }

    pub fn hdel(mut self, key: &str, field: &str) -> Self {
        self.pipe.hdel(key, field);
        self
    }

    pub fn sadd(mut self, key: &str, member: &str) -> Self {
        self.pipe.sadd(key, member);
        self
    }

    pub fn srem(mut self, key: &str, member: &str) -> Self {
        self.pipe.srem(key, member);
        self
    }

    pub fn del(mut self, key: &str) -> Self {
        self.pipe.del(key);
        self
    }

    pub fn publish(mut self, channel: &str, message: &str) -> Self {
        self.pipe.publish(channel, message);
        self
    }

    /// Commits the block atomically (`MULTI` ... `EXEC`).
    pub async fn commit(mut self) -> Result<()> {
        self.pipe.atomic();
        let mut conn = self.store.conn();
        match self.pipe.query_async::<()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "atomic store transaction failed; block discarded");
                Err(MirrorbitsError::Store(e))
            }
        }
    }
}

/// Compares two dotted version strings (`"6.2.0"`) numerically component by
/// component; a missing or non-numeric component counts as `0`.
fn version_less_than(actual: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u32> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (a, m) = (parse(actual), parse(minimum));
    for i in 0..a.len().max(m.len()) {
        let (av, mv) = (a.get(i).copied().unwrap_or(0), m.get(i).copied().unwrap_or(0));
        if av != mv {
            return av < mv;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison_is_numeric_not_lexical() {
        assert!(!version_less_than("6.10.0", "6.2.0"));
        assert!(version_less_than("6.1.9", "6.2.0"));
        assert!(!version_less_than("6.2.0", "6.2.0"));
        assert!(version_less_than("5.9.9", "6.2.0"));
    }
}
