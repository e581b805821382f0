// src/scanner/mod.rs

//! The source repository scanner (C5) and mirror scanners (C6), sharing the
//! temp-set-then-rename reconciliation pattern and per-path invalidation
//! publishing used throughout the indexing substrate.

pub mod ftp;
pub mod rsync;
pub mod source;

use crate::error::{MirrorbitsError, Result};
use crate::lock::ClusterLock;
use crate::metrics;
use crate::model::FileInfo;
use crate::pubsub;
use crate::store::Store;
use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

const LOCK_RETRY_ATTEMPTS: u32 = 10;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// `Scan(url, mirrorID, stop) -> {...}` result shared by both mirror
/// scanners (§4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanResult {
    pub files_indexed: usize,
    pub known_indexed: usize,
    pub removed: usize,
    pub tz_offset_ms: i64,
}

/// A single remote file observation, in the scanner's own time units
/// (nanoseconds since epoch, matching [`FileInfo::mod_time`]).
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub path: String,
    pub size: i64,
    pub mod_time: i64,
}

/// Retries `lock.acquire` up to [`LOCK_RETRY_ATTEMPTS`] times, one second
/// apart, before giving up with a distinguished contention error (§4.5).
pub(crate) async fn acquire_with_retry(
    lock: &ClusterLock,
    key: &str,
    identifier: &str,
) -> Result<crate::lock::LockHandle> {
    for attempt in 0..LOCK_RETRY_ATTEMPTS {
        match lock.acquire(key, identifier).await {
            Ok(handle) => return Ok(handle),
            Err(MirrorbitsError::ScanInProgress) => {
                metrics::LOCK_CONTENTIONS_TOTAL.inc();
                if attempt + 1 == LOCK_RETRY_ATTEMPTS {
                    return Err(MirrorbitsError::ScanInProgress);
                }
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(MirrorbitsError::ScanInProgress)
}

pub(crate) fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub(crate) async fn fetch_file_info(store: &Store, path: &str) -> Result<Option<FileInfo>> {
    let key = format!("FILE_{path}");
    let fields = store.hgetall(&key).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(crate::cache::file_info_from_fields(path, &fields)))
}

/// Computes the per-mirror timezone offset (§4.6): the median signed
/// difference (authoritative − mirror) over the path intersection between
/// `entries` and the source file set, in nanoseconds. Returns `None` when
/// the intersection is empty.
pub(crate) async fn detect_timezone_offset(
    store: &Store,
    entries: &[RemoteEntry],
) -> Result<Option<i64>> {
    let mut diffs = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(info) = fetch_file_info(store, &entry.path).await? {
            diffs.push(info.mod_time - entry.mod_time);
        }
    }
    if diffs.is_empty() {
        return Ok(None);
    }
    diffs.sort_unstable();
    Ok(Some(diffs[diffs.len() / 2]))
}

/// §4.6: "if its absolute value is within a configured tolerance of an
/// exact multiple of 1 hour, subtract that offset ... otherwise leave
/// unadjusted". Returns the offset to apply (0 when no adjustment qualifies).
pub(crate) fn qualifying_offset(median_ns: i64, tolerance_secs: i64) -> i64 {
    const HOUR_NS: i64 = 3_600 * 1_000_000_000;
    let tolerance_ns = tolerance_secs.saturating_mul(1_000_000_000);
    let nearest_hour = ((median_ns as f64) / (HOUR_NS as f64)).round() as i64 * HOUR_NS;
    if (median_ns - nearest_hour).abs() <= tolerance_ns {
        nearest_hour
    } else {
        0
    }
}

/// Reconciles a mirror's scanned file set against the store (§4.6): writes
/// `FILEINFO_<id>_<path>`, maintains `FILEMIRRORS_<path>`, and performs the
/// `MIRROR_<id>_FILES_TMP -> MIRROR_<id>_FILES` rename. Requires the
/// authoritative source set to already exist.
pub(crate) async fn reconcile_mirror(
    store: &Store,
    mirror_id: u64,
    entries: &[RemoteEntry],
) -> Result<(usize, usize)> {
    if !store.exists("FILES").await? {
        return Err(MirrorbitsError::PreconditionFailed(
            "source file set has not been scanned yet".into(),
        ));
    }

    let tmp_key = format!("MIRRORFILES_{mirror_id}_TMP");
    let files_key = format!("MIRRORFILES_{mirror_id}");
    store.del(&tmp_key).await?;

    let mut scanned = HashSet::with_capacity(entries.len());
    let mut known_indexed = 0usize;
    for entry in entries {
        scanned.insert(entry.path.clone());
        if fetch_file_info(store, &entry.path).await?.is_some() {
            known_indexed += 1;
        }

        let info_key = format!("FILEINFO_{mirror_id}_{}", entry.path);
        let existing_size: Option<String> = store.hget(&info_key, "size").await?;
        let changed = existing_size
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            != Some(entry.size);

        if changed {
            let mut fields = HashMap::new();
            fields.insert("size".to_string(), entry.size.to_string());
            fields.insert("mod_time".to_string(), entry.mod_time.to_string());
            store.hset_multiple(&info_key, &fields).await?;
            store.sadd(&format!("FILEMIRRORS_{}", entry.path), &mirror_id.to_string())
                .await?;
            store
                .publish(
                    pubsub::MIRROR_FILE_UPDATE,
                    &format!("{mirror_id} {}", entry.path),
                )
                .await?;
        }
        store.sadd(&tmp_key, &entry.path).await?;
    }

    let previously_known = store.smembers(&files_key).await?;
    let removed: Vec<&String> = previously_known.iter().filter(|p| !scanned.contains(*p)).collect();
    for path in &removed {
        store.del(&format!("FILEINFO_{mirror_id}_{path}")).await?;
        store
            .srem(&format!("FILEMIRRORS_{path}"), &mirror_id.to_string())
            .await?;
        store
            .publish(pubsub::MIRROR_FILE_UPDATE, &format!("{mirror_id} {path}"))
            .await?;
    }

    store.rename(&tmp_key, &files_key).await?;
    Ok((known_indexed, removed.len()))
}

/// Records `lastSync`/`lastSuccessfulSync` and publishes `mirror_update`
/// (§4.6: "update lastSync (always) and lastSuccessfulSync (only on
/// success)").
pub(crate) async fn record_sync_outcome(store: &Store, mirror_id: u64, success: bool) -> Result<()> {
    let now = now_ns();
    let mut fields = HashMap::new();
    fields.insert("last_sync".to_string(), now.to_string());
    if success {
        fields.insert("last_successful_sync".to_string(), now.to_string());
    }
    store
        .hset_multiple(&format!("MIRROR_{mirror_id}"), &fields)
        .await?;
    store
        .publish(pubsub::MIRROR_UPDATE, &mirror_id.to_string())
        .await?;
    let outcome = if success { "success" } else { "failure" };
    metrics::SCANS_TOTAL.with_label_values(&[outcome]).inc();
    Ok(())
}

pub fn warn_scan_error(mirror_id: u64, url: &str, err: &MirrorbitsError) {
    warn!(mirror_id, url, error = %err, "mirror scan failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifying_offset_snaps_to_nearest_hour_within_tolerance() {
        let one_hour_ns = 3_600 * 1_000_000_000;
        assert_eq!(qualifying_offset(one_hour_ns + 2_000_000_000, 300), one_hour_ns);
        assert_eq!(qualifying_offset(one_hour_ns + 10 * 60 * 1_000_000_000, 300), 0);
        assert_eq!(qualifying_offset(0, 300), 0);
    }
}
