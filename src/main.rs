// src/main.rs

//! The mirror redirector daemon's entry point.

use anyhow::{Context, Result};
use mirrorbits::cache::{Cache, CacheConfig};
use mirrorbits::config::ConfigHandle;
use mirrorbits::geo::GeoResolver;
use mirrorbits::lock::ClusterLock;
use mirrorbits::model::Mirror;
use mirrorbits::scanner::ftp::FtpCredentials;
use mirrorbits::scanner::{ftp, rsync, source};
use mirrorbits::store::Store;
use mirrorbits::{monitor, server};
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    if args.contains(&"--version".to_string()) {
        println!("mirrorbitsd version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.yaml");

    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();
    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = run(config_path, reload_handle).await {
        error!(error = %e, "daemon exited with an error");
        return Err(e);
    }
    Ok(())
}

async fn run(
    config_path: &str,
    _log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let config = ConfigHandle::load(config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;
    let identifier = format!("{}-{}", hostname(), std::process::id());

    let store = connect_store(&config).await?;
    let geo = Arc::new(GeoResolver::load(
        config.get().geoip_database_path.clone(),
        config.get().geoip_asn_database_path.clone(),
    )?);
    let cache = Cache::new(store.clone(), CacheConfig::default());
    cache.spawn_invalidator();
    let lock = ClusterLock::new(store.clone());

    let (shutdown_tx, _) = broadcast::channel(1);

    spawn_source_scanner(store.clone(), lock.clone(), identifier.clone(), config.clone());
    spawn_mirror_scanner(store.clone(), lock.clone(), identifier.clone(), config.clone());
    spawn_monitor(store.clone(), cache.clone(), config.clone());
    spawn_reload_handler(config.clone(), geo.clone());
    spawn_shutdown_signal(shutdown_tx.clone());

    info!("mirrorbitsd starting");
    server::run(store, cache, geo, config, shutdown_tx.subscribe()).await
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "mirrorbitsd".to_string())
}

async fn connect_store(config: &Arc<ConfigHandle>) -> Result<Store> {
    let cfg = config.get();
    if !cfg.redis_sentinels.is_empty() {
        let master_name = cfg
            .redis_sentinel_master
            .as_deref()
            .context("redis_sentinel_master required when redis_sentinels is set")?;
        Ok(Store::connect_via_sentinel(
            &cfg.redis_sentinels,
            master_name,
            cfg.redis_password.as_deref(),
            cfg.redis_db,
        )
        .await?)
    } else {
        Ok(Store::connect(&cfg.redis_address, cfg.redis_password.as_deref(), cfg.redis_db).await?)
    }
}

/// Periodically rescans the source repository (§4.5), on
/// `repository_scan_interval_minutes`.
fn spawn_source_scanner(store: Store, lock: ClusterLock, identifier: String, config: Arc<ConfigHandle>) {
    tokio::spawn(async move {
        loop {
            let cfg = config.get();
            let interval = Duration::from_secs(cfg.repository_scan_interval_minutes.max(1) * 60);
            tokio::time::sleep(interval).await;
            let cfg = config.get();
            match source::scan(
                &store,
                &lock,
                &identifier,
                &cfg.repository,
                &cfg.hashes,
                cfg.dummy_scan_mode,
                false,
            )
            .await
            {
                Ok(result) => info!(
                    indexed = result.files_indexed,
                    removed = result.removed,
                    "repository scan complete"
                ),
                Err(e) => mirrorbits::scanner::warn_scan_error(0, "source", &e),
            }
        }
    });
}

/// Periodically rescans every enabled mirror (§4.6), on
/// `scan_interval_minutes`.
fn spawn_mirror_scanner(store: Store, lock: ClusterLock, identifier: String, config: Arc<ConfigHandle>) {
    tokio::spawn(async move {
        loop {
            let cfg = config.get();
            let interval = Duration::from_secs(cfg.scan_interval_minutes.max(1) * 60);
            tokio::time::sleep(interval).await;
            let cfg = config.get();
            let mirrors = match store.hgetall("MIRRORS").await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "failed to list mirrors for scheduled scan");
                    continue;
                }
            };
            for id_str in mirrors.keys() {
                let Ok(id) = id_str.parse::<u64>() else { continue };
                let fields = match store.hgetall(&format!("MIRROR_{id}")).await {
                    Ok(f) if !f.is_empty() => f,
                    _ => continue,
                };
                let Ok(mirror) = mirrorbits::cache::mirror_from_fields(id, &fields) else { continue };
                if !mirror.enabled {
                    continue;
                }
                scan_one_mirror(&store, &lock, &identifier, &mirror, &cfg).await;
            }
        }
    });
}

async fn scan_one_mirror(
    store: &Store,
    lock: &ClusterLock,
    identifier: &str,
    mirror: &Mirror,
    cfg: &mirrorbits::config::Config,
) {
    let stop = Arc::new(AtomicBool::new(false));
    let outcome = if let Some(rsync_url) = &mirror.rsync_url {
        rsync::scan(
            store,
            lock,
            identifier,
            mirror.id,
            rsync_url,
            cfg.timezone_tolerance_seconds,
            cfg.fix_timezone_offsets,
            stop,
        )
        .await
    } else if let Some(ftp_url) = &mirror.ftp_url {
        let Ok(url) = url::Url::parse(ftp_url) else {
            warn!(mirror = mirror.id, "invalid FTP sync URL");
            return;
        };
        ftp::scan(
            store,
            lock,
            identifier,
            mirror.id,
            url.host_str().unwrap_or_default(),
            url.path(),
            FtpCredentials {
                user: if url.username().is_empty() { None } else { Some(url.username()) },
                password: url.password(),
            },
            cfg.timezone_tolerance_seconds,
            cfg.fix_timezone_offsets,
            stop,
        )
        .await
    } else {
        return;
    };

    if let Err(e) = outcome {
        mirrorbits::scanner::warn_scan_error(mirror.id, &mirror.name, &e);
    }
}

/// Periodically probes every mirror's trace file over HTTP/HTTPS (§4.7), on
/// `check_interval_seconds`.
fn spawn_monitor(store: Store, cache: Cache, config: Arc<ConfigHandle>) {
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        loop {
            let cfg = config.get();
            tokio::time::sleep(Duration::from_secs(cfg.check_interval_seconds.max(1))).await;
            let cfg = config.get();
            let mirrors = match store.hgetall("MIRRORS").await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "failed to list mirrors for health check");
                    continue;
                }
            };
            let ids: Vec<u64> = mirrors.keys().filter_map(|k| k.parse().ok()).collect();
            let monitor_config = monitor::MonitorConfig {
                check_interval: Duration::from_secs(cfg.check_interval_seconds.max(1)),
                concurrent_sync: cfg.concurrent_sync,
                stale_sync_hours: cfg.stale_sync_hours,
                trace_file: cfg.trace_file_location.clone(),
            };
            if let Err(e) = monitor::run_pass(&store, &cache, &http, &monitor_config, &ids, None).await {
                warn!(error = %e, "health check pass failed");
            }
        }
    });
}

/// Reloads the configuration and geo databases on `SIGHUP` (§5, §9).
#[cfg(unix)]
fn spawn_reload_handler(config: Arc<ConfigHandle>, geo: Arc<GeoResolver>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };
        loop {
            hangup.recv().await;
            info!("SIGHUP received; reloading configuration and geo databases");
            if let Err(e) = config.reload() {
                error!(error = %e, "configuration reload failed");
            }
            geo.reload();
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_handler(_config: Arc<ConfigHandle>, _geo: Arc<GeoResolver>) {}

/// Triggers graceful shutdown on `SIGINT`/`SIGTERM`.
fn spawn_shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });
}
