// src/monitor.rs

//! The mirror health monitor (C7, §4.7): periodically probes each enabled
//! mirror's trace file over HTTP and HTTPS, flips up/down state atomically,
//! and schedules a rescan for mirrors that just came back up with a stale
//! last successful sync.

use crate::cache::Cache;
use crate::error::Result;
use crate::metrics;
use crate::model::Mirror;
use crate::pubsub;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Notifies the caller that a mirror just transitioned to up with a stale
/// sync, and should be rescanned.
pub type RescanSender = tokio::sync::mpsc::Sender<u64>;

pub struct MonitorConfig {
    pub check_interval: Duration,
    pub concurrent_sync: usize,
    pub stale_sync_hours: i64,
    pub trace_file: String,
}

/// Runs one probe pass over every enabled mirror listed in `mirror_ids`,
/// bounded to `config.concurrent_sync` concurrent probes (§4.7).
#[instrument(skip(store, cache, http, config, rescan))]
pub async fn run_pass(
    store: &Store,
    cache: &Cache,
    http: &reqwest::Client,
    config: &MonitorConfig,
    mirror_ids: &[u64],
    rescan: Option<&RescanSender>,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(config.concurrent_sync.max(1)));
    let mut tasks = Vec::with_capacity(mirror_ids.len());

    for &id in mirror_ids {
        let Some(mirror) = cache.mirror(id).await? else {
            continue;
        };
        if !mirror.enabled {
            continue;
        }
        let permit = semaphore.clone().acquire_owned().await.ok();
        let store = store.clone();
        let http = http.clone();
        let trace_file = config.trace_file.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            probe_mirror(&store, &http, &mirror, &trace_file).await
        }));
    }

    let mut up_count = 0i64;
    for task in tasks {
        match task.await {
            Ok(Ok(Some(transitioned))) => {
                if transitioned.now_up {
                    up_count += 1;
                    let stale = is_stale(transitioned.mirror.last_successful_sync, config.stale_sync_hours);
                    if stale {
                        if let Some(rescan) = rescan {
                            let _ = rescan.try_send(transitioned.mirror.id).map_err(|_| {
                                warn!(mirror_id = transitioned.mirror.id, "rescan channel full; dropping request")
                            });
                        }
                    }
                } else {
                    debug!(mirror_id = transitioned.mirror.id, "mirror not up in this pass");
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(error = %e, "mirror probe task failed"),
            Err(e) => warn!(error = %e, "mirror probe task panicked"),
        }
    }

    metrics::MIRRORS_UP.set(up_count);
    Ok(())
}

struct Transition {
    mirror: Mirror,
    now_up: bool,
}

/// Probes a single mirror over HTTP and HTTPS and, on a state change,
/// atomically updates `stateSince` and publishes `mirror_update` (§4.7).
/// Returns `None` when the mirror's up/down state did not change.
async fn probe_mirror(
    store: &Store,
    http: &reqwest::Client,
    mirror: &Mirror,
    trace_file: &str,
) -> Result<Option<Transition>> {
    let (http_up, http_mod_time) = probe_scheme(http, &mirror.http_url, trace_file).await;
    let (https_up, https_mod_time) = probe_https(http, mirror, trace_file).await;
    let last_mod_time = http_mod_time.or(https_mod_time);

    if let Some(last_mod_time) = last_mod_time
        && last_mod_time != mirror.last_mod_time
    {
        store
            .hset(
                &format!("MIRROR_{}", mirror.id),
                "last_mod_time",
                &last_mod_time.to_string(),
            )
            .await?;
    }

    if http_up == mirror.http_up && https_up == mirror.https_up {
        return Ok(None);
    }

    let now = crate::scanner::now_ns();
    let mut fields = HashMap::new();
    fields.insert("http_up".to_string(), http_up.to_string());
    fields.insert("https_up".to_string(), https_up.to_string());
    fields.insert("state_since".to_string(), now.to_string());
    store
        .hset_multiple(&format!("MIRROR_{}", mirror.id), &fields)
        .await?;
    store
        .publish(pubsub::MIRROR_UPDATE, &mirror.id.to_string())
        .await?;

    info!(
        mirror_id = mirror.id,
        http_up, https_up, "mirror up/down state transitioned"
    );

    let mut updated = mirror.clone();
    updated.http_up = http_up;
    updated.https_up = https_up;
    updated.state_since = now;
    updated.last_mod_time = last_mod_time.unwrap_or(mirror.last_mod_time);

    Ok(Some(Transition {
        now_up: http_up || https_up,
        mirror: updated,
    }))
}

async fn probe_https(http: &reqwest::Client, mirror: &Mirror, trace_file: &str) -> (bool, Option<i64>) {
    let https_url = mirror.http_url.replacen("http://", "https://", 1);
    if https_url == mirror.http_url {
        return (false, None);
    }
    probe_scheme(http, &https_url, trace_file).await
}

/// Fetches the trace file and reads its body (§4.7: "probe responses parse
/// a single integer timestamp"). A successful probe is any 2xx/3xx
/// response; the parsed `lastModTime` is `None` when the body isn't a bare
/// integer or the request failed outright.
async fn probe_scheme(http: &reqwest::Client, base_url: &str, trace_file: &str) -> (bool, Option<i64>) {
    let url = format!("{}/{trace_file}", base_url.trim_end_matches('/'));
    match http.get(&url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
            let mod_time = resp.text().await.ok().and_then(|body| parse_trace_file(&body));
            (true, mod_time)
        }
        _ => (false, None),
    }
}

/// Parses the trace file body as a single integer timestamp
/// (`lastModTime`, §4.7).
pub fn parse_trace_file(body: &str) -> Option<i64> {
    body.trim().parse::<i64>().ok()
}

fn is_stale(last_successful_sync_ns: i64, stale_sync_hours: i64) -> bool {
    if last_successful_sync_ns == 0 {
        return true;
    }
    let now = crate::scanner::now_ns();
    let threshold_ns = stale_sync_hours.saturating_mul(3_600) * 1_000_000_000;
    now - last_successful_sync_ns > threshold_ns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trace_file_reads_single_integer() {
        assert_eq!(parse_trace_file("1700000000\n"), Some(1_700_000_000));
        assert_eq!(parse_trace_file("not a number"), None);
    }

    #[test]
    fn zero_last_sync_is_always_stale() {
        assert!(is_stale(0, 24));
    }

    #[test]
    fn recent_sync_is_not_stale() {
        let now = crate::scanner::now_ns();
        assert!(!is_stale(now, 24));
    }
}
