// src/scanner/rsync.rs

//! The rsync mirror scanner (§4.6): shells out to `rsync` for a recursive
//! listing of the mirror, parses its output, and reconciles it against the
//! store the same way the source scanner reconciles the repository.

use super::{
    acquire_with_retry, detect_timezone_offset, qualifying_offset, reconcile_mirror,
    record_sync_outcome, RemoteEntry, ScanResult,
};
use crate::error::{MirrorbitsError, Result};
use crate::lock::ClusterLock;
use crate::store::Store;
use chrono::NaiveDateTime;
use regex::Regex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

static LISTING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+([\d,]+)\s+(\S+)\s+(\S+)\s+(.+)$").unwrap());

/// Scans `url` via `rsync` and reconciles the mirror's file set (§4.6).
/// `stop` is polled cooperatively between output lines; once set the child
/// process is killed and [`MirrorbitsError::ScanAborted`] is returned.
pub async fn scan(
    store: &Store,
    lock: &ClusterLock,
    identifier: &str,
    mirror_id: u64,
    url: &str,
    timezone_tolerance_secs: i64,
    fix_timezone_offsets: bool,
    stop: Arc<AtomicBool>,
) -> Result<ScanResult> {
    let key = format!("SCANNING_{mirror_id}");
    let handle = acquire_with_retry(lock, &key, identifier).await?;

    let outcome = scan_inner(
        store,
        mirror_id,
        url,
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
    url: &str,
    timezone_tolerance_secs: i64,
    fix_timezone_offsets: bool,
    stop: Arc<AtomicBool>,
) -> Result<ScanResult> {
    let mut child = Command::new("rsync")
        .arg("-r")
        .arg("--no-motd")
        .arg("--timeout=30")
        .arg("--contimeout=30")
        .arg("--exclude=.~tmp~/")
        .arg(url)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(MirrorbitsError::Io)?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut entries = Vec::new();
    loop {
        if stop.load(Ordering::SeqCst) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(MirrorbitsError::ScanAborted);
        }
        match lines.next_line().await.map_err(MirrorbitsError::Io)? {
            Some(line) => {
                if let Some(entry) = parse_line(&line) {
                    entries.push(entry);
                }
            }
            None => break,
        }
    }

    let status = child.wait().await.map_err(MirrorbitsError::Io)?;
    map_exit_status(status.code())?;

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
        url,
        files_indexed = entries.len(),
        known_indexed,
        removed,
        tz_offset_ms = tz_offset_ns / 1_000_000,
        "rsync scan complete"
    );

    Ok(ScanResult {
        files_indexed: entries.len(),
        known_indexed,
        removed,
        tz_offset_ms: tz_offset_ns / 1_000_000,
    })
}

/// Maps the exit code of the `rsync` child process per §4.6's deterministic
/// table. `23` (partial transfer) is logged and treated as success.
fn map_exit_status(code: Option<i32>) -> Result<()> {
    match code {
        Some(0) => Ok(()),
        Some(23) => {
            warn!("rsync reported a partial transfer (exit 23); treating as success");
            Ok(())
        }
        Some(5) => Err(MirrorbitsError::RsyncProtocol),
        Some(10) | Some(11) => Err(MirrorbitsError::Io(std::io::Error::other(
            "rsync reported an I/O error",
        ))),
        Some(30) | Some(35) => Err(MirrorbitsError::RsyncTimeout),
        Some(code) => Err(MirrorbitsError::Internal(format!(
            "rsync exited with unrecognized status {code}"
        ))),
        None => Err(MirrorbitsError::ScanAborted),
    }
}

/// Parses a single `rsync` listing line: `<perms> <size> <date> <time>
/// <path>`. Directory and symlink entries (first permission character `d`
/// or `l`) are skipped; size commas are stripped.
fn parse_line(line: &str) -> Option<RemoteEntry> {
    let caps = LISTING_LINE.captures(line.trim_end())?;
    let perms = &caps[1];
    if perms.starts_with('d') || perms.starts_with('l') {
        return None;
    }
    let size: i64 = caps[2].replace(',', "").parse().ok()?;
    let date = &caps[3];
    let time = &caps[4];
    let mut path = caps[5].to_string();
    if !path.starts_with('/') {
        path = format!("/{path}");
    }

    let timestamp = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y/%m/%d %H:%M:%S").ok()?;
    let mod_time = timestamp.and_utc().timestamp_nanos_opt().unwrap_or(0);

    Some(RemoteEntry {
        path,
        size,
        mod_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_file_line_and_strips_size_commas() {
        let line = "-rw-r--r--     1,234,567 2024/01/02 03:04:05 pub/linux/kernel.tar.gz";
        let entry = parse_line(line).expect("line should parse");
        assert_eq!(entry.size, 1_234_567);
        assert_eq!(entry.path, "/pub/linux/kernel.tar.gz");
    }

    #[test]
    fn skips_directory_and_symlink_entries() {
        assert!(parse_line("drwxr-xr-x          4,096 2024/01/02 03:04:05 pub/linux").is_none());
        assert!(parse_line("lrwxrwxrwx             11 2024/01/02 03:04:05 pub/latest -> linux/").is_none());
    }

    #[test]
    fn map_exit_status_treats_23_as_success() {
        assert!(map_exit_status(Some(23)).is_ok());
        assert!(matches!(
            map_exit_status(Some(5)),
            Err(MirrorbitsError::RsyncProtocol)
        ));
        assert!(matches!(
            map_exit_status(Some(35)),
            Err(MirrorbitsError::RsyncTimeout)
        ));
    }
}
