// src/admin/mod.rs

//! The administrative surface (C9, §4.9): mirror lifecycle management,
//! each mutation going through the store in a single atomic block together
//! with its invalidation publish.

pub mod commands;

use crate::cache::{mirror_from_fields, mirror_to_fields};
use crate::error::{MirrorbitsError, Result};
use crate::geo::GeoResolver;
use crate::model::{ClientGeo, Mirror, StatsBucket};
use crate::pubsub;
use crate::store::Store;
use std::collections::HashMap;
use tracing::warn;

/// The fields an operator supplies when registering a new mirror; the
/// remaining `Mirror` fields start at their defaults.
#[derive(Debug, Clone)]
pub struct NewMirror {
    pub name: String,
    pub http_url: String,
    pub rsync_url: Option<String>,
    pub ftp_url: Option<String>,
    pub sponsor_name: String,
    pub sponsor_url: String,
    pub admin_name: String,
    pub admin_email: String,
    pub continent_only: bool,
    pub country_only: bool,
    pub as_only: bool,
}

/// Registers a new mirror (§4.9 "Add"): allocates an id from the atomic
/// `LAST_MID` counter, geo-resolves the HTTP URL's host, and rejects
/// duplicate names.
pub async fn add(store: &Store, geo: &GeoResolver, new: NewMirror) -> Result<Mirror> {
    let existing_names = store.hgetall("MIRRORS").await?;
    if existing_names.values().any(|n| n == &new.name) {
        return Err(MirrorbitsError::NameAlreadyTaken(new.name));
    }
    if new.rsync_url.is_none() && new.ftp_url.is_none() {
        return Err(MirrorbitsError::NoSyncMethod);
    }

    let id = store.incr("LAST_MID").await? as u64;

    let mut mirror = Mirror::new(id, new.name.clone(), new.http_url);
    mirror.rsync_url = new.rsync_url;
    mirror.ftp_url = new.ftp_url;
    mirror.sponsor_name = new.sponsor_name;
    mirror.sponsor_url = new.sponsor_url;
    mirror.admin_name = new.admin_name;
    mirror.admin_email = new.admin_email;
    mirror.continent_only = new.continent_only;
    mirror.country_only = new.country_only;
    mirror.as_only = new.as_only;

    apply_geo(geo, &mut mirror).await;

    store
        .transaction()
        .hset_multiple(&format!("MIRROR_{id}"), &mirror_to_fields(&mirror))
        .hset("MIRRORS", &id.to_string(), &mirror.name)
        .publish(pubsub::MIRROR_UPDATE, &id.to_string())
        .commit()
        .await?;

    Ok(mirror)
}

/// Removes a mirror (§4.9 "Remove"), cascading through every path it
/// carries: drops `PerMirrorFile` and its membership in `mirrors(path)`
/// before deleting the mirror record and its log.
pub async fn remove(store: &Store, mirror_id: u64) -> Result<()> {
    let paths = store.smembers(&format!("MIRRORFILES_{mirror_id}")).await?;

    let mut txn = store.transaction();
    for path in &paths {
        txn = txn
            .del(&format!("FILEINFO_{mirror_id}_{path}"))
            .srem(&format!("FILEMIRRORS_{path}"), &mirror_id.to_string());
    }
    txn.del(&format!("MIRRORFILES_{mirror_id}"))
        .del(&format!("MIRRORFILES_{mirror_id}_TMP"))
        .del(&format!("MIRROR_{mirror_id}"))
        .del(&format!("MIRRORLOGS_{mirror_id}"))
        .hdel("MIRRORS", &mirror_id.to_string())
        .publish(pubsub::MIRROR_UPDATE, &mirror_id.to_string())
        .commit()
        .await
}

/// Enables or disables a mirror, publishing the invalidation (§4.9).
pub async fn set_enabled(store: &Store, mirror_id: u64, enabled: bool) -> Result<()> {
    store
        .transaction()
        .hset(&format!("MIRROR_{mirror_id}"), "enabled", &enabled.to_string())
        .publish(pubsub::MIRROR_UPDATE, &mirror_id.to_string())
        .commit()
        .await
}

/// Applies `mutate` to the mirror's current record and returns a YAML diff
/// of before/after (§4.9 "Edit").
pub async fn edit(
    store: &Store,
    mirror_id: u64,
    mutate: impl FnOnce(&mut Mirror),
) -> Result<String> {
    let key = format!("MIRROR_{mirror_id}");
    let fields = store.hgetall(&key).await?;
    if fields.is_empty() {
        return Err(MirrorbitsError::NotFound);
    }
    let before = mirror_from_fields(mirror_id, &fields)?;
    let mut after = before.clone();
    mutate(&mut after);

    store
        .transaction()
        .hset_multiple(&key, &mirror_to_fields(&after))
        .publish(pubsub::MIRROR_UPDATE, &mirror_id.to_string())
        .commit()
        .await?;

    Ok(yaml_diff(&before, &after))
}

/// Re-resolves a mirror's coordinates from its HTTP URL's host (§4.9).
pub async fn geo_update(store: &Store, geo: &GeoResolver, mirror_id: u64) -> Result<Mirror> {
    let key = format!("MIRROR_{mirror_id}");
    let fields = store.hgetall(&key).await?;
    if fields.is_empty() {
        return Err(MirrorbitsError::NotFound);
    }
    let mut mirror = mirror_from_fields(mirror_id, &fields)?;
    apply_geo(geo, &mut mirror).await;
    store
        .transaction()
        .hset_multiple(&key, &mirror_to_fields(&mirror))
        .publish(pubsub::MIRROR_UPDATE, &mirror_id.to_string())
        .commit()
        .await?;
    Ok(mirror)
}

/// Returns the most recent bounded log entries for a mirror (§4.9 "logs").
pub async fn logs(store: &Store, mirror_id: u64, limit: isize) -> Result<Vec<String>> {
    store.lrange(&format!("MIRRORLOGS_{mirror_id}"), 0, limit.max(1) - 1).await
}

/// Appends a line to a mirror's bounded log, trimming it to `max_len`.
pub async fn log_line(store: &Store, mirror_id: u64, line: &str, max_len: isize) -> Result<()> {
    store
        .lpush_bounded(&format!("MIRRORLOGS_{mirror_id}"), line, max_len)
        .await
}

/// Reads the counters for a given stats bucket key (§4.9 "stats", §6).
pub async fn stats(store: &Store, bucket: &str) -> Result<StatsBucket> {
    let per_file_raw = store.hgetall(&format!("STATS_FILE_{bucket}")).await?;
    let per_mirror_raw = store.hgetall(&format!("STATS_MIRROR_{bucket}")).await?;
    let per_mirror_bytes_raw = store.hgetall(&format!("STATS_MIRROR_BYTES_{bucket}")).await?;

    let per_file: HashMap<String, u64> = per_file_raw
        .into_iter()
        .filter_map(|(k, v)| v.parse().ok().map(|v| (k, v)))
        .collect();
    let per_mirror_requests: HashMap<u64, u64> = per_mirror_raw
        .into_iter()
        .filter_map(|(k, v)| Some((k.parse().ok()?, v.parse().ok()?)))
        .collect();
    let per_mirror_bytes: HashMap<u64, u64> = per_mirror_bytes_raw
        .into_iter()
        .filter_map(|(k, v)| Some((k.parse().ok()?, v.parse().ok()?)))
        .collect();
    let all_files = per_file.values().sum();

    Ok(StatsBucket {
        all_files,
        per_file,
        per_mirror_requests,
        per_mirror_bytes,
    })
}

async fn apply_geo(geo: &GeoResolver, mirror: &mut Mirror) {
    let Ok(url) = url::Url::parse(&mirror.http_url) else {
        return;
    };
    let Some(host) = url.host_str() else { return };

    let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host, 80))
        .await
        .map(|it| it.collect())
        .unwrap_or_default();
    if addrs.len() > 1 {
        warn!(host, count = addrs.len(), "HTTP URL host resolves to multiple addresses; using the first");
    }
    let Some(addr) = addrs.first() else {
        warn!(host, "could not resolve HTTP URL host for geo-update");
        return;
    };

    if let ClientGeo::Valid {
        country_code,
        continent_code,
        latitude,
        longitude,
        ..
    } = geo.lookup(addr.ip())
    {
        mirror.latitude = latitude as f32;
        mirror.longitude = longitude as f32;
        mirror.continent_code = continent_code;
        if mirror.country_codes.is_empty() {
            mirror.country_codes.push(country_code);
        } else {
            mirror.country_codes[0] = country_code;
        }
    }
}

fn yaml_diff(before: &Mirror, after: &Mirror) -> String {
    let before_yaml = serde_yaml::to_string(before).unwrap_or_default();
    let after_yaml = serde_yaml::to_string(after).unwrap_or_default();
    if before_yaml == after_yaml {
        return String::new();
    }
    let before_lines: Vec<&str> = before_yaml.lines().collect();
    let after_lines: Vec<&str> = after_yaml.lines().collect();
    let mut diff = String::new();
    for line in &before_lines {
        if !after_lines.contains(line) {
            diff.push_str(&format!("-{line}\n"));
        }
    }
    for line in &after_lines {
        if !before_lines.contains(line) {
            diff.push_str(&format!("+{line}\n"));
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_diff_is_empty_for_identical_mirrors() {
        let mirror = Mirror::new(1, "a", "http://a.example");
        assert_eq!(yaml_diff(&mirror, &mirror), "");
    }

    #[test]
    fn yaml_diff_reports_changed_field() {
        let before = Mirror::new(1, "a", "http://a.example");
        let mut after = before.clone();
        after.enabled = true;
        let diff = yaml_diff(&before, &after);
        assert!(diff.contains("-enabled: false"));
        assert!(diff.contains("+enabled: true"));
    }
}
