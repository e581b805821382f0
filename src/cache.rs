// src/cache.rs

//! The local, per-process LRU cache (C3, §4.3) sitting in front of the
//! shared store. Four independent tables, invalidated by a single
//! background subscriber on the three pub/sub channels. On subscription
//! loss the cache purges all four tables before resubscribing, rather than
//! risk serving stale entries across the disconnection window.

use crate::model::{FileInfo, Mirror};
use crate::pubsub;
use crate::store::Store;
use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Capacities for the four LRU tables, in entry-count units (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub file_info_capacity: usize,
    pub mirror_set_capacity: usize,
    pub mirror_capacity: usize,
    pub per_mirror_file_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file_info_capacity: 10_000,
            mirror_set_capacity: 10_000,
            mirror_capacity: 1_000,
            per_mirror_file_capacity: 50_000,
        }
    }
}

fn non_zero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

/// An external component's registration for forwarded invalidation
/// notifications. Sends are non-blocking and dropped if the receiver is
/// slow (§4.3).
pub type InvalidationSender = mpsc::Sender<Invalidation>;

#[derive(Debug, Clone)]
pub enum Invalidation {
    File(String),
    Mirror(u64),
    MirrorFile(u64, String),
}

struct Tables {
    file_info: Mutex<LruCache<String, FileInfo>>,
    mirror_set: Mutex<LruCache<String, HashSet<u64>>>,
    mirror: Mutex<LruCache<u64, Mirror>>,
    per_mirror_file: Mutex<LruCache<(u64, String), i64>>,
}

/// The invalidating local cache (C3).
#[derive(Clone)]
pub struct Cache {
    store: Store,
    tables: Arc<Tables>,
    forward: Arc<Mutex<Vec<InvalidationSender>>>,
}

impl Cache {
    pub fn new(store: Store, config: CacheConfig) -> Self {
        let tables = Arc::new(Tables {
            file_info: Mutex::new(LruCache::new(non_zero(config.file_info_capacity))),
            mirror_set: Mutex::new(LruCache::new(non_zero(config.mirror_set_capacity))),
            mirror: Mutex::new(LruCache::new(non_zero(config.mirror_capacity))),
            per_mirror_file: Mutex::new(LruCache::new(non_zero(config.per_mirror_file_capacity))),
        });
        Self {
            store,
            tables,
            forward: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a channel to receive forwarded invalidation notifications.
    pub fn register_listener(&self, tx: InvalidationSender) {
        self.forward.lock().push(tx);
    }

    fn notify(&self, invalidation: Invalidation) {
        self.forward
            .lock()
            .retain(|tx| tx.try_send(invalidation.clone()).is_ok());
    }

    /// Spawns the background subscriber task. Runs until the process exits;
    /// reconnects and purges all tables on any subscription loss.
    pub fn spawn_invalidator(&self) {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                match cache.store.subscribe(&pubsub::ALL_CHANNELS).await {
                    Ok(mut pubsub) => {
                        debug!("cache invalidator subscribed to invalidation channels");
                        let mut stream = pubsub.on_message();
                        loop {
                            match stream.next().await {
                                Some(msg) => cache.handle_message(
                                    msg.get_channel_name(),
                                    msg.get_payload::<String>().unwrap_or_default(),
                                ),
                                None => {
                                    warn!(
                                        "pub/sub connection lost; purging all cache tables before resubscribing"
                                    );
                                    cache.purge_all();
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed to subscribe to invalidation channels; purging and retrying");
                        cache.purge_all();
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
    }

    fn handle_message(&self, channel: &str, payload: String) {
        match channel {
            pubsub::FILE_UPDATE => {
                self.tables.file_info.lock().pop(&payload);
                self.notify(Invalidation::File(payload));
            }
            pubsub::MIRROR_UPDATE => {
                if let Ok(id) = payload.parse::<u64>() {
                    self.tables.mirror.lock().pop(&id);
                    self.notify(Invalidation::Mirror(id));
                }
            }
            pubsub::MIRROR_FILE_UPDATE => {
                if let Some((id, path)) = pubsub::parse_mirror_file_payload(&payload) {
                    self.tables
                        .per_mirror_file
                        .lock()
                        .pop(&(id, path.to_string()));
                    self.tables.mirror_set.lock().pop(path);
                    self.notify(Invalidation::MirrorFile(id, path.to_string()));
                }
            }
            _ => {}
        }
    }

    fn purge_all(&self) {
        self.tables.file_info.lock().clear();
        self.tables.mirror_set.lock().clear();
        self.tables.mirror.lock().clear();
        self.tables.per_mirror_file.lock().clear();
    }

    // -- FileInfo --------------------------------------------------------

    pub async fn file_info(&self, path: &str) -> crate::error::Result<Option<FileInfo>> {
        if let Some(info) = self.tables.file_info.lock().get(path).cloned() {
            crate::metrics::CACHE_HITS_TOTAL.with_label_values(&["file_info"]).inc();
            return Ok(Some(info));
        }
        crate::metrics::CACHE_MISSES_TOTAL.with_label_values(&["file_info"]).inc();
        let key = format!("FILE_{path}");
        let fields = self.store.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let info = file_info_from_fields(path, &fields);
        self.tables.file_info.lock().put(path.to_string(), info.clone());
        Ok(Some(info))
    }

    // -- Mirror ------------------------------------------------------------

    pub async fn mirror(&self, id: u64) -> crate::error::Result<Option<Mirror>> {
        if let Some(mirror) = self.tables.mirror.lock().get(&id).cloned() {
            crate::metrics::CACHE_HITS_TOTAL.with_label_values(&["mirror"]).inc();
            return Ok(Some(mirror));
        }
        crate::metrics::CACHE_MISSES_TOTAL.with_label_values(&["mirror"]).inc();
        let key = format!("MIRROR_{id}");
        let fields = self.store.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mirror = mirror_from_fields(id, &fields)?;
        self.tables.mirror.lock().put(id, mirror.clone());
        Ok(Some(mirror))
    }

    // -- mirrors(path) -------------------------------------------------------

    pub async fn mirrors_for_path(&self, path: &str) -> crate::error::Result<HashSet<u64>> {
        if let Some(set) = self.tables.mirror_set.lock().get(path).cloned() {
            crate::metrics::CACHE_HITS_TOTAL.with_label_values(&["mirror_set"]).inc();
            return Ok(set);
        }
        crate::metrics::CACHE_MISSES_TOTAL.with_label_values(&["mirror_set"]).inc();
        let key = format!("FILEMIRRORS_{path}");
        let members = self.store.smembers(&key).await?;
        let ids: HashSet<u64> = members.iter().filter_map(|m| m.parse().ok()).collect();
        self.tables
            .mirror_set
            .lock()
            .put(path.to_string(), ids.clone());
        Ok(ids)
    }

    // -- PerMirrorFile -------------------------------------------------------

    pub async fn per_mirror_file_size(
        &self,
        mirror_id: u64,
        path: &str,
    ) -> crate::error::Result<Option<i64>> {
        let cache_key = (mirror_id, path.to_string());
        if let Some(size) = self.tables.per_mirror_file.lock().get(&cache_key).copied() {
            crate::metrics::CACHE_HITS_TOTAL.with_label_values(&["per_mirror_file"]).inc();
            return Ok(Some(size));
        }
        crate::metrics::CACHE_MISSES_TOTAL.with_label_values(&["per_mirror_file"]).inc();
        let key = format!("FILEINFO_{mirror_id}_{path}");
        let size: Option<String> = self.store.hget(&key, "size").await?;
        let Some(size) = size else { return Ok(None) };
        let size: i64 = size.parse().unwrap_or(0);
        self.tables.per_mirror_file.lock().put(cache_key, size);
        Ok(Some(size))
    }
}

pub fn file_info_from_fields(path: &str, fields: &std::collections::HashMap<String, String>) -> FileInfo {
    FileInfo {
        path: path.to_string(),
        size: fields.get("size").and_then(|s| s.parse().ok()).unwrap_or(0),
        mod_time: fields
            .get("mod_time")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        sha1: fields.get("sha1").filter(|s| !s.is_empty()).cloned(),
        sha256: fields.get("sha256").filter(|s| !s.is_empty()).cloned(),
        md5: fields.get("md5").filter(|s| !s.is_empty()).cloned(),
        sha3_512: fields.get("sha3_512").filter(|s| !s.is_empty()).cloned(),
    }
}

pub fn mirror_from_fields(
    id: u64,
    fields: &std::collections::HashMap<String, String>,
) -> crate::error::Result<Mirror> {
    let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
    let get_bool = |k: &str| get(k) == "true" || get(k) == "1";
    let get_i64 = |k: &str| get(k).parse::<i64>().unwrap_or(0);
    let get_i32 = |k: &str| get(k).parse::<i32>().unwrap_or(0);
    let get_f32 = |k: &str| get(k).parse::<f32>().unwrap_or(0.0);
    let get_u32 = |k: &str| get(k).parse::<u32>().unwrap_or(0);

    let allow_redirects = match get("allow_redirects").as_str() {
        "deny" => crate::model::RedirectPolicy::Deny,
        "allow" => crate::model::RedirectPolicy::Allow,
        _ => crate::model::RedirectPolicy::Default,
    };

    Ok(Mirror {
        id,
        name: get("name"),
        http_url: get("http_url"),
        rsync_url: fields.get("rsync_url").filter(|s| !s.is_empty()).cloned(),
        ftp_url: fields.get("ftp_url").filter(|s| !s.is_empty()).cloned(),
        sponsor_name: get("sponsor_name"),
        sponsor_url: get("sponsor_url"),
        admin_name: get("admin_name"),
        admin_email: get("admin_email"),
        custom_data: get("custom_data"),
        continent_only: get_bool("continent_only"),
        country_only: get_bool("country_only"),
        as_only: get_bool("as_only"),
        score: get_i32("score"),
        latitude: get_f32("latitude"),
        longitude: get_f32("longitude"),
        continent_code: get("continent_code"),
        country_codes: split_codes(&get("country_codes")),
        excluded_country_codes: split_codes(&get("excluded_country_codes")),
        asnum: get_u32("asnum"),
        allow_redirects,
        enabled: get_bool("enabled"),
        http_up: get_bool("http_up"),
        https_up: get_bool("https_up"),
        http_down_reason: get("http_down_reason"),
        https_down_reason: get("https_down_reason"),
        state_since: get_i64("state_since"),
        last_sync: get_i64("last_sync"),
        last_successful_sync: get_i64("last_successful_sync"),
        last_mod_time: get_i64("last_mod_time"),
    })
}

fn split_codes(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

pub fn mirror_to_fields(mirror: &Mirror) -> std::collections::HashMap<String, String> {
    let allow_redirects = match mirror.allow_redirects {
        crate::model::RedirectPolicy::Default => "default",
        crate::model::RedirectPolicy::Deny => "deny",
        crate::model::RedirectPolicy::Allow => "allow",
    };
    [
        ("name".to_string(), mirror.name.clone()),
        ("http_url".to_string(), mirror.http_url.clone()),
        ("rsync_url".to_string(), mirror.rsync_url.clone().unwrap_or_default()),
        ("ftp_url".to_string(), mirror.ftp_url.clone().unwrap_or_default()),
        ("sponsor_name".to_string(), mirror.sponsor_name.clone()),
        ("sponsor_url".to_string(), mirror.sponsor_url.clone()),
        ("admin_name".to_string(), mirror.admin_name.clone()),
        ("admin_email".to_string(), mirror.admin_email.clone()),
        ("custom_data".to_string(), mirror.custom_data.clone()),
        ("continent_only".to_string(), mirror.continent_only.to_string()),
        ("country_only".to_string(), mirror.country_only.to_string()),
        ("as_only".to_string(), mirror.as_only.to_string()),
        ("score".to_string(), mirror.score.to_string()),
        ("latitude".to_string(), mirror.latitude.to_string()),
        ("longitude".to_string(), mirror.longitude.to_string()),
        ("continent_code".to_string(), mirror.continent_code.clone()),
        ("country_codes".to_string(), mirror.country_codes.join(" ")),
        (
            "excluded_country_codes".to_string(),
            mirror.excluded_country_codes.join(" "),
        ),
        ("asnum".to_string(), mirror.asnum.to_string()),
        ("allow_redirects".to_string(), allow_redirects.to_string()),
        ("enabled".to_string(), mirror.enabled.to_string()),
        ("http_up".to_string(), mirror.http_up.to_string()),
        ("https_up".to_string(), mirror.https_up.to_string()),
        ("http_down_reason".to_string(), mirror.http_down_reason.clone()),
        ("https_down_reason".to_string(), mirror.https_down_reason.clone()),
        ("state_since".to_string(), mirror.state_since.to_string()),
        ("last_sync".to_string(), mirror.last_sync.to_string()),
        (
            "last_successful_sync".to_string(),
            mirror.last_successful_sync.to_string(),
        ),
        ("last_mod_time".to_string(), mirror.last_mod_time.to_string()),
    ]
    .into_iter()
    .collect()
}

pub fn file_info_to_fields(info: &FileInfo) -> std::collections::HashMap<String, String> {
    [
        ("size".to_string(), info.size.to_string()),
        ("mod_time".to_string(), info.mod_time.to_string()),
        ("sha1".to_string(), info.sha1.clone().unwrap_or_default()),
        ("sha256".to_string(), info.sha256.clone().unwrap_or_default()),
        ("md5".to_string(), info.md5.clone().unwrap_or_default()),
        (
            "sha3_512".to_string(),
            info.sha3_512.clone().unwrap_or_default(),
        ),
    ]
    .into_iter()
    .collect()
}
