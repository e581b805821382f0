//! The shared data model (§3): the structs persisted through the shared
//! store (C1) and read back through the local cache (C3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tri-state override for whether a mirror may answer with an HTTP redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RedirectPolicy {
    #[default]
    Default,
    Deny,
    Allow,
}

/// The authoritative description of a file in the reference repository.
///
/// Invariant: exactly one `FileInfo` per distinct path in the source
/// repository's most recent scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Repository-relative path, always starting with `/`.
    pub path: String,
    pub size: i64,
    /// Nanoseconds since the Unix epoch.
    pub mod_time: i64,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub sha3_512: Option<String>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: i64, mod_time: i64) -> Self {
        Self {
            path: path.into(),
            size,
            mod_time,
            sha1: None,
            sha256: None,
            md5: None,
            sha3_512: None,
        }
    }
}

/// A remote mirror record (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    pub id: u64,
    pub name: String,
    pub http_url: String,
    pub rsync_url: Option<String>,
    pub ftp_url: Option<String>,
    pub sponsor_name: String,
    pub sponsor_url: String,
    pub admin_name: String,
    pub admin_email: String,
    pub custom_data: String,

    pub continent_only: bool,
    pub country_only: bool,
    pub as_only: bool,

    /// Administrative bias, a percent-style multiplier. Default 0.
    pub score: i32,

    pub latitude: f32,
    pub longitude: f32,
    pub continent_code: String,
    /// Index 0 is the primary country code; the rest are additional.
    pub country_codes: Vec<String>,
    pub excluded_country_codes: Vec<String>,
    pub asnum: u32,

    pub allow_redirects: RedirectPolicy,
    pub enabled: bool,

    pub http_up: bool,
    pub https_up: bool,
    pub http_down_reason: String,
    pub https_down_reason: String,
    /// Nanoseconds since epoch of the last up/down transition.
    pub state_since: i64,

    pub last_sync: i64,
    pub last_successful_sync: i64,
    pub last_mod_time: i64,
}

impl Mirror {
    pub fn new(id: u64, name: impl Into<String>, http_url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            http_url: http_url.into(),
            rsync_url: None,
            ftp_url: None,
            sponsor_name: String::new(),
            sponsor_url: String::new(),
            admin_name: String::new(),
            admin_email: String::new(),
            custom_data: String::new(),
            continent_only: false,
            country_only: false,
            as_only: false,
            score: 0,
            latitude: 0.0,
            longitude: 0.0,
            continent_code: String::new(),
            country_codes: Vec::new(),
            excluded_country_codes: Vec::new(),
            asnum: 0,
            allow_redirects: RedirectPolicy::Default,
            enabled: false,
            http_up: false,
            https_up: false,
            http_down_reason: String::new(),
            https_down_reason: String::new(),
            state_since: 0,
            last_sync: 0,
            last_successful_sync: 0,
            last_mod_time: 0,
        }
    }

    pub fn primary_country(&self) -> Option<&str> {
        self.country_codes.first().map(String::as_str)
    }

    pub fn is_up(&self) -> bool {
        self.http_up || self.https_up
    }

    pub fn has_sync_method(&self) -> bool {
        self.rsync_url.is_some() || self.ftp_url.is_some()
    }
}

/// Presence and size of a given path on a given mirror (§3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerMirrorFile {
    pub size: i64,
}

/// A single event recorded in a mirror's bounded log (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorLogEntry {
    pub timestamp: i64,
    pub message: String,
}

/// Client geolocation, as resolved by C4. An invalid record (empty
/// `country_code`) is modeled as a distinct variant so callers cannot
/// accidentally treat zeroed coordinates as a real location (§9 design note).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientGeo {
    Valid {
        country_code: String,
        continent_code: String,
        city: String,
        country_name: String,
        latitude: f64,
        longitude: f64,
        as_name: String,
        as_num: u32,
    },
    Invalid,
}

impl ClientGeo {
    pub fn is_valid(&self) -> bool {
        matches!(self, ClientGeo::Valid { .. })
    }

    pub fn country_code(&self) -> Option<&str> {
        match self {
            ClientGeo::Valid { country_code, .. } => Some(country_code.as_str()),
            ClientGeo::Invalid => None,
        }
    }

    pub fn continent_code(&self) -> Option<&str> {
        match self {
            ClientGeo::Valid { continent_code, .. } => Some(continent_code.as_str()),
            ClientGeo::Invalid => None,
        }
    }

    pub fn as_num(&self) -> Option<u32> {
        match self {
            ClientGeo::Valid { as_num, .. } => Some(*as_num),
            ClientGeo::Invalid => None,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match self {
            ClientGeo::Valid {
                latitude, longitude, ..
            } => Some((*latitude, *longitude)),
            ClientGeo::Invalid => None,
        }
    }
}

/// Per-day/month/year bucketed counters (§3). The bucket key is a date
/// string such as `"2026-07-31"`, `"2026-07"`, or `"2026"`; the coarsest
/// prefix that fully covers a queried interval is used by readers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsBucket {
    pub all_files: u64,
    pub per_file: HashMap<String, u64>,
    pub per_mirror_requests: HashMap<u64, u64>,
    pub per_mirror_bytes: HashMap<u64, u64>,
}
