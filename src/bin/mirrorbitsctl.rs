// src/bin/mirrorbitsctl.rs

//! The administrative CLI (§4.9 "mirrorbitsctl"), operating directly
//! against the shared store — there is no separate RPC transport.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mirrorbits::admin::{commands, NewMirror};
use mirrorbits::config::Config;
use mirrorbits::geo::GeoResolver;
use mirrorbits::store::Store;

#[derive(Parser)]
#[command(name = "mirrorbitsctl", about = "Administer a mirror redirector's mirror list")]
struct Cli {
    #[arg(long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a new mirror.
    Add {
        name: String,
        http_url: String,
        #[arg(long)]
        rsync_url: Option<String>,
        #[arg(long)]
        ftp_url: Option<String>,
        #[arg(long, default_value = "")]
        sponsor_name: String,
        #[arg(long, default_value = "")]
        sponsor_url: String,
        #[arg(long, default_value = "")]
        admin_name: String,
        #[arg(long, default_value = "")]
        admin_email: String,
        #[arg(long)]
        continent_only: bool,
        #[arg(long)]
        country_only: bool,
        #[arg(long)]
        as_only: bool,
    },
    /// Remove a mirror and every file it carries.
    Remove { mirror_id: u64 },
    /// Enable a disabled mirror.
    Enable { mirror_id: u64 },
    /// Disable a mirror.
    Disable { mirror_id: u64 },
    /// Re-resolve a mirror's coordinates from its HTTP URL.
    GeoUpdate { mirror_id: u64 },
    /// Show a mirror's recent scan log.
    Logs {
        mirror_id: u64,
        #[arg(long, default_value_t = 20)]
        limit: isize,
    },
    /// Show request counters for a bucket (e.g. `2026-07-31`).
    Stats { bucket: String },
    /// List the available commands.
    Help,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    let store = Store::connect(&config.redis_address, config.redis_password.as_deref(), config.redis_db)
        .await
        .context("connecting to the shared store")?;

    match cli.command {
        Command::Add {
            name,
            http_url,
            rsync_url,
            ftp_url,
            sponsor_name,
            sponsor_url,
            admin_name,
            admin_email,
            continent_only,
            country_only,
            as_only,
        } => {
            let geo = GeoResolver::load(config.geoip_database_path, config.geoip_asn_database_path)?;
            let mirror = commands::add(
                &store,
                &geo,
                NewMirror {
                    name,
                    http_url,
                    rsync_url,
                    ftp_url,
                    sponsor_name,
                    sponsor_url,
                    admin_name,
                    admin_email,
                    continent_only,
                    country_only,
                    as_only,
                },
            )
            .await?;
            println!("registered mirror {} ({})", mirror.id, mirror.name);
        }
        Command::Remove { mirror_id } => {
            commands::remove(&store, mirror_id).await?;
            println!("removed mirror {mirror_id}");
        }
        Command::Enable { mirror_id } => {
            commands::set_enabled(&store, mirror_id, true).await?;
            println!("enabled mirror {mirror_id}");
        }
        Command::Disable { mirror_id } => {
            commands::set_enabled(&store, mirror_id, false).await?;
            println!("disabled mirror {mirror_id}");
        }
        Command::GeoUpdate { mirror_id } => {
            let geo = GeoResolver::load(config.geoip_database_path, config.geoip_asn_database_path)?;
            let mirror = commands::geo_update(&store, &geo, mirror_id).await?;
            println!(
                "mirror {} now at ({}, {})",
                mirror.id, mirror.latitude, mirror.longitude
            );
        }
        Command::Logs { mirror_id, limit } => {
            for line in commands::logs(&store, mirror_id, limit).await? {
                println!("{line}");
            }
        }
        Command::Stats { bucket } => {
            let stats = commands::stats(&store, &bucket).await?;
            println!("files served: {}", stats.all_files);
            for (path, count) in &stats.per_file {
                println!("  {path}: {count}");
            }
            for (mirror_id, count) in &stats.per_mirror_requests {
                let bytes = stats.per_mirror_bytes.get(mirror_id).copied().unwrap_or(0);
                println!("  mirror {mirror_id}: {count} requests, {bytes} bytes");
            }
        }
        Command::Help => {
            for spec in commands::COMMANDS {
                println!("{:<12} {}", spec.name, spec.summary);
            }
        }
    }

    Ok(())
}
