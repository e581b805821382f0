// src/scanner/ftp.rs

//! The FTP mirror scanner (§4.6): anonymous (or credentialed) login,
//! MLST/MDTM negotiation, and a recursive directory walk, reconciled
//! against the store the same way the rsync scanner is.

use super::{
    acquire_with_retry, detect_timezone_offset, qualifying_offset, reconcile_mirror,
    record_sync_outcome, RemoteEntry, ScanResult,
};
use crate::error::{MirrorbitsError, Result};
use crate::lock::ClusterLock;
use crate::store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use suppaftp::list::File as ListEntry;
use suppaftp::AsyncFtpStream;
use tracing::{info, warn};

pub struct FtpCredentials<'a> {
    pub user: Option<&'a str>,
    pub password: Option<&'a str>,
}

/// Scans `host` via FTP and reconciles the mirror's file set (§4.6).
/// `stop` is polled cooperatively between directories.
pub async fn scan(
    store: &Store,
    lock: &ClusterLock,
    identifier: &str,
    mirror_id: u64,
    host: &str,
    root_path: &str,
    credentials: FtpCredentials<'_>,
    timezone_tolerance_secs: i64,
    fix_timezone_offsets: bool,
    stop: Arc<AtomicBool>,
) -> Result<ScanResult> {
    let key = format!("SCANNING_{mirror_id}");
    let handle = acquire_with_retry(lock, &key, identifier).await?;

    let outcome = scan_inner(
        store,
        mirror_id,
        host,
        root_path,
        credentials,
        timezone_tolerance_secs,
        fix_timezone_offsets,
        stop,
    )
    .await;

    record_sync_outcome(store, mirror_id, outcome.is_ok()).await?;
    handle.release().await?;
    outcome
}

async fn scan_inner(
    store: &Store,
    mirror_id: u64,
    host: &str,
    root_path: &str,
    credentials: FtpCredentials<'_>,
    timezone_tolerance_secs: i64,
    fix_timezone_offsets: bool,
    stop: Arc<AtomicBool>,
) -> Result<ScanResult> {
    let mut ftp = AsyncFtpStream::connect(host)
        .await
        .map_err(|e| MirrorbitsError::Internal(format!("connecting to {host}: {e}")))?;

    let (user, password) = match (credentials.user, credentials.password) {
        (Some(u), Some(p)) => (u, p),
        _ => ("anonymous", "anonymous@"),
    };
    ftp.login(user, password)
        .await
        .map_err(|e| MirrorbitsError::Internal(format!("FTP login failed: {e}")))?;

    let features = ftp.feat().await.unwrap_or_default();
    let has_mlst = features.keys().any(|k| k.eq_ignore_ascii_case("MLST"));
    let has_mdtm = features.keys().any(|k| k.eq_ignore_ascii_case("MDTM"));
    if !has_mlst {
        warn!(mirror_id, "FTP server does not advertise MLST; falling back to LIST parsing");
    }
    if !has_mdtm {
        warn!(mirror_id, "FTP server does not advertise MDTM; using listing-provided times");
    }

    ftp.cwd(root_path)
        .await
        .map_err(|e| MirrorbitsError::Internal(format!("cwd to {root_path}: {e}")))?;

    let mut entries = Vec::new();
    walk(&mut ftp, "/", has_mlst, has_mdtm, &stop, &mut entries).await?;

    let _ = ftp.quit().await;

    let median = detect_timezone_offset(store, &entries).await?;
    let mut tz_offset_ns = 0i64;
    if let Some(median) = median {
        if fix_timezone_offsets {
            tz_offset_ns = qualifying_offset(median, timezone_tolerance_secs);
        }
    }
    if tz_offset_ns != 0 {
        for entry in &mut entries {
            entry.mod_time -= tz_offset_ns;
        }
    }

    let (known_indexed, removed) = reconcile_mirror(store, mirror_id, &entries).await?;

    info!(
        mirror_id,
        files_indexed = entries.len(),
        known_indexed,
        removed,
        tz_offset_ms = tz_offset_ns / 1_000_000,
        "FTP scan complete"
    );

    Ok(ScanResult {
        files_indexed: entries.len(),
        known_indexed,
        removed,
        tz_offset_ms: tz_offset_ns / 1_000_000,
    })
}

/// Recursively lists `dir` (relative to the repository root, always
/// starting with `/`), appending file entries to `out`. Loop detection
/// skips any entry literally named `.` or `..`.
async fn walk(
    ftp: &mut AsyncFtpStream,
    dir: &str,
    has_mlst: bool,
    has_mdtm: bool,
    stop: &Arc<AtomicBool>,
    out: &mut Vec<RemoteEntry>,
) -> Result<()> {
    if stop.load(Ordering::SeqCst) {
        return Err(MirrorbitsError::ScanAborted);
    }

    let listed = list_directory(ftp, dir, has_mlst).await?;

    for item in listed {
        if item.name() == "." || item.name() == ".." {
            continue;
        }
        let child_path = if dir == "/" {
            format!("/{}", item.name())
        } else {
            format!("{dir}/{}", item.name())
        };

        if item.is_directory() {
            Box::pin(walk(ftp, &child_path, has_mlst, has_mdtm, stop, out)).await?;
            continue;
        }
        if item.is_symlink() {
            continue;
        }

        let mod_time = if has_mdtm {
            match ftp.mdtm(&child_path).await {
                Ok(naive) => naive.and_utc().timestamp_nanos_opt().unwrap_or(0),
                Err(_) => system_time_to_ns(item.modified()),
            }
        } else {
            system_time_to_ns(item.modified())
        };

        out.push(RemoteEntry {
            path: child_path,
            size: item.size() as i64,
            mod_time,
        });
    }

    Ok(())
}

async fn list_directory(ftp: &mut AsyncFtpStream, dir: &str, has_mlst: bool) -> Result<Vec<ListEntry>> {
    if has_mlst {
        if let Ok(lines) = ftp.mlsd(Some(dir)).await {
            return Ok(lines
                .iter()
                .filter_map(|line| ListEntry::from_mlsx_line(line).ok())
                .collect());
        }
    }
    let lines = ftp
        .list(Some(dir))
        .await
        .map_err(|e| MirrorbitsError::Internal(format!("LIST {dir}: {e}")))?;
    Ok(lines
        .iter()
        .filter_map(|line| ListEntry::try_from(line.as_str()).ok())
        .collect())
}

fn system_time_to_ns(time: std::time::SystemTime) -> i64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    #[test]
    fn loop_guard_names_are_recognized() {
        assert!([".", ".."].contains(&"."));
        assert!([".", ".."].contains(&".."));
    }
}
