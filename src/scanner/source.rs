// src/scanner/source.rs

//! The source repository scanner (C5, §4.5): depth-first walk of the
//! configured repository root, rehashing only when forced or when the
//! stored record is stale, reconciled against the store via the
//! `FILES_TMP -> FILES` rename pattern.

use super::{acquire_with_retry, ScanResult};
use crate::config::HashesConfig;
use crate::error::{MirrorbitsError, Result};
use crate::lock::ClusterLock;
use crate::model::FileInfo;
use crate::pubsub;
use crate::store::Store;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{info, instrument};
use walkdir::WalkDir;

const SOURCE_LOCK_KEY: &str = "SCANNING_SOURCE";

#[derive(Default)]
struct Hashes {
    sha1: Option<String>,
    sha256: Option<String>,
    md5: Option<String>,
    sha3_512: Option<String>,
}

/// Scans the configured repository root and reconciles the authoritative
/// `FILES` set (§4.5). `force_rehash` recomputes every configured hash
/// regardless of whether size/mtime changed.
#[instrument(skip(store, lock, hashes_cfg))]
pub async fn scan(
    store: &Store,
    lock: &ClusterLock,
    identifier: &str,
    repo_root: &Path,
    hashes_cfg: &HashesConfig,
    dummy_mode: bool,
    force_rehash: bool,
) -> Result<ScanResult> {
    let handle = acquire_with_retry(lock, SOURCE_LOCK_KEY, identifier).await?;

    let result = scan_inner(store, repo_root, hashes_cfg, dummy_mode, force_rehash).await;

    handle.release().await?;
    crate::metrics::SCANS_TOTAL
        .with_label_values(&[if result.is_ok() { "success" } else { "failure" }])
        .inc();
    result
}

async fn scan_inner(
    store: &Store,
    repo_root: &Path,
    hashes_cfg: &HashesConfig,
    dummy_mode: bool,
    force_rehash: bool,
) -> Result<ScanResult> {
    let canonical_root = repo_root
        .canonicalize()
        .map_err(MirrorbitsError::Io)?;

    let mut scanned = HashSet::new();

    for entry in WalkDir::new(&canonical_root).follow_links(false) {
        let entry = entry.map_err(|e| MirrorbitsError::Internal(format!("walking repository: {e}")))?;
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(&canonical_root)
            .map_err(|_| MirrorbitsError::OutsideRepository)?;
        let rel_path = format!("/{}", rel.to_string_lossy().replace('\\', "/"));

        let (info, changed) =
            build_file_info(store, &rel_path, entry.path(), hashes_cfg, dummy_mode, force_rehash).await?;

        if changed {
            store
                .hset_multiple(&format!("FILE_{rel_path}"), &crate::cache::file_info_to_fields(&info))
                .await?;
            store.publish(pubsub::FILE_UPDATE, &rel_path).await?;
        }
        scanned.insert(rel_path);
    }

    let existing: HashSet<String> = store.smembers("FILES").await?;
    let removed: Vec<&String> = existing.difference(&scanned).collect();
    for path in &removed {
        store.del(&format!("FILE_{path}")).await?;
        store.publish(pubsub::FILE_UPDATE, path).await?;
    }

    store.del("FILES_TMP").await?;
    for path in &scanned {
        store.sadd("FILES_TMP", path).await?;
    }
    store.rename("FILES_TMP", "FILES").await?;

    info!(
        files_indexed = scanned.len(),
        removed = removed.len(),
        "source repository scan complete"
    );

    Ok(ScanResult {
        files_indexed: scanned.len(),
        known_indexed: 0,
        removed: removed.len(),
        tz_offset_ms: 0,
    })
}

async fn build_file_info(
    store: &Store,
    path: &str,
    fs_path: &Path,
    hashes_cfg: &HashesConfig,
    dummy_mode: bool,
    force_rehash: bool,
) -> Result<(FileInfo, bool)> {
    let existing = super::fetch_file_info(store, path).await?;

    let (size, mod_time, hashes) = if dummy_mode {
        read_dummy_descriptor(fs_path)?
    } else {
        let meta = std::fs::metadata(fs_path)?;
        let size = meta.len() as i64;
        let mod_time = mod_time_ns(&meta);
        let rehash = needs_rehash(existing.as_ref(), size, mod_time, hashes_cfg, force_rehash);
        let hashes = if rehash {
            compute_hashes(fs_path, hashes_cfg)?
        } else {
            Hashes {
                sha1: existing.as_ref().and_then(|e| e.sha1.clone()),
                sha256: existing.as_ref().and_then(|e| e.sha256.clone()),
                md5: existing.as_ref().and_then(|e| e.md5.clone()),
                sha3_512: existing.as_ref().and_then(|e| e.sha3_512.clone()),
            }
        };
        (size, mod_time, hashes)
    };

    let info = FileInfo {
        path: path.to_string(),
        size,
        mod_time,
        sha1: hashes.sha1,
        sha256: hashes.sha256,
        md5: hashes.md5,
        sha3_512: hashes.sha3_512,
    };
    let changed = existing.as_ref() != Some(&info);
    Ok((info, changed))
}

fn needs_rehash(
    existing: Option<&FileInfo>,
    size: i64,
    mod_time: i64,
    hashes_cfg: &HashesConfig,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    let Some(existing) = existing else {
        return true;
    };
    if existing.size != size || existing.mod_time != mod_time {
        return true;
    }
    (hashes_cfg.sha1 && existing.sha1.is_none())
        || (hashes_cfg.sha256 && existing.sha256.is_none())
        || (hashes_cfg.md5 && existing.md5.is_none())
        || (hashes_cfg.sha3_512 && existing.sha3_512.is_none())
}

fn mod_time_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Computes only the hashes enabled in `cfg`, in a single streaming pass
/// over the file (§4.5: "one read per file").
fn compute_hashes(path: &Path, cfg: &HashesConfig) -> Result<Hashes> {
    use sha2::Digest;

    let mut file = std::fs::File::open(path)?;
    let mut sha1 = cfg.sha1.then(sha1::Sha1::new);
    let mut sha256 = cfg.sha256.then(sha2::Sha256::new);
    let mut md5 = cfg.md5.then(md5::Md5::new);
    let mut sha3 = cfg.sha3_512.then(sha3::Sha3_512::new);

    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Some(h) = sha1.as_mut() {
            h.update(&buf[..n]);
        }
        if let Some(h) = sha256.as_mut() {
            h.update(&buf[..n]);
        }
        if let Some(h) = md5.as_mut() {
            h.update(&buf[..n]);
        }
        if let Some(h) = sha3.as_mut() {
            h.update(&buf[..n]);
        }
    }

    Ok(Hashes {
        sha1: sha1.map(|h| hex::encode(h.finalize())),
        sha256: sha256.map(|h| hex::encode(h.finalize())),
        md5: md5.map(|h| hex::encode(h.finalize())),
        sha3_512: sha3.map(|h| hex::encode(h.finalize())),
    })
}

/// Dummy-file mode (§4.5): a small descriptor in place of the real payload,
/// formatted as `<size> <mod_time_ns>` on the first line and
/// `<sha1|-> <sha256|-> <md5|-> <sha3_512|->` on the second.
fn read_dummy_descriptor(path: &Path) -> Result<(i64, i64, Hashes)> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();

    let mut head = lines.next().unwrap_or_default().split_whitespace();
    let size: i64 = head.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let mod_time: i64 = head.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    let mut tail = lines.next().unwrap_or_default().split_whitespace();
    let hash_field = |v: Option<&str>| v.filter(|s| *s != "-").map(str::to_string);
    let hashes = Hashes {
        sha1: hash_field(tail.next()),
        sha256: hash_field(tail.next()),
        md5: hash_field(tail.next()),
        sha3_512: hash_field(tail.next()),
    };

    Ok((size, mod_time, hashes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashesConfig;

    #[test]
    fn dummy_descriptor_parses_size_mtime_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("descriptor");
        std::fs::write(&path, "1234 5678\nabc123 - - -\n").unwrap();
        let (size, mod_time, hashes) = read_dummy_descriptor(&path).unwrap();
        assert_eq!(size, 1234);
        assert_eq!(mod_time, 5678);
        assert_eq!(hashes.sha1.as_deref(), Some("abc123"));
        assert!(hashes.sha256.is_none());
    }

    #[test]
    fn needs_rehash_detects_missing_configured_hash() {
        let cfg = HashesConfig {
            sha1: true,
            sha256: true,
            md5: false,
            sha3_512: false,
        };
        let existing = FileInfo {
            path: "/a".into(),
            size: 10,
            mod_time: 1,
            sha1: None,
            sha256: Some("x".into()),
            md5: None,
            sha3_512: None,
        };
        assert!(needs_rehash(Some(&existing), 10, 1, &cfg, false));
        assert!(!needs_rehash(
            Some(&FileInfo {
                sha1: Some("y".into()),
                ..existing
            }),
            10,
            1,
            &cfg,
            false
        ));
    }

}
