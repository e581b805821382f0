// src/admin/commands.rs

//! A typed command table for the administrative surface: each admin
//! operation is a named entry, callable by `mirrorbitsctl` without going
//! through a reflection-based dispatcher.

use super::NewMirror;
use crate::error::Result;
use crate::geo::GeoResolver;
use crate::model::{Mirror, StatsBucket};
use crate::store::Store;

/// One admin command: a human-readable name plus a short usage summary.
/// `mirrorbitsctl` matches its subcommand against [`COMMANDS`] to decide
/// which of the `admin::*` functions to call and how to format the result.
pub struct CommandSpec {
    pub name: &'static str,
    pub summary: &'static str,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "add",
        summary: "register a new mirror",
    },
    CommandSpec {
        name: "remove",
        summary: "remove a mirror and every file it carries",
    },
    CommandSpec {
        name: "edit",
        summary: "change a mirror's fields, printing a diff",
    },
    CommandSpec {
        name: "enable",
        summary: "enable a disabled mirror",
    },
    CommandSpec {
        name: "disable",
        summary: "disable a mirror",
    },
    CommandSpec {
        name: "geo-update",
        summary: "re-resolve a mirror's coordinates from its HTTP URL",
    },
    CommandSpec {
        name: "logs",
        summary: "show a mirror's recent scan log",
    },
    CommandSpec {
        name: "stats",
        summary: "show request counters for a bucket",
    },
];

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// `mirrorbitsctl add` entry point.
pub async fn add(store: &Store, geo: &GeoResolver, new: NewMirror) -> Result<Mirror> {
    super::add(store, geo, new).await
}

/// `mirrorbitsctl remove` entry point.
pub async fn remove(store: &Store, mirror_id: u64) -> Result<()> {
    super::remove(store, mirror_id).await
}

/// `mirrorbitsctl enable`/`disable` entry point.
pub async fn set_enabled(store: &Store, mirror_id: u64, enabled: bool) -> Result<()> {
    super::set_enabled(store, mirror_id, enabled).await
}

/// `mirrorbitsctl geo-update` entry point.
pub async fn geo_update(store: &Store, geo: &GeoResolver, mirror_id: u64) -> Result<Mirror> {
    super::geo_update(store, geo, mirror_id).await
}

/// `mirrorbitsctl logs` entry point.
pub async fn logs(store: &Store, mirror_id: u64, limit: isize) -> Result<Vec<String>> {
    super::logs(store, mirror_id, limit).await
}

/// `mirrorbitsctl stats` entry point.
pub async fn stats(store: &Store, bucket: &str) -> Result<StatsBucket> {
    super::stats(store, bucket).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_documented_command_is_findable() {
        for spec in COMMANDS {
            assert!(lookup(spec.name).is_some());
        }
        assert!(lookup("bogus").is_none());
    }
}
