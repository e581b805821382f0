// src/geo.rs

//! IP geolocation (C4, §4.4): city+country and ASN MaxMind databases,
//! reloaded on SIGHUP only when their modification time has actually
//! changed. Lookups take a read lock; reloads take a write lock, so readers
//! never block each other (§5).

use crate::error::{MirrorbitsError, Result};
use crate::model::ClientGeo;
use maxminddb::geoip2;
use parking_lot::RwLock;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{info, warn};

struct Databases {
    city: maxminddb::Reader<Vec<u8>>,
    city_mtime: SystemTime,
    asn: maxminddb::Reader<Vec<u8>>,
    asn_mtime: SystemTime,
}

/// The geo resolver (C4). Loads its databases at construction and supports
/// in-place reload via [`GeoResolver::reload`].
pub struct GeoResolver {
    city_path: PathBuf,
    asn_path: PathBuf,
    databases: RwLock<Databases>,
}

fn mtime_of(path: &PathBuf) -> Result<SystemTime> {
    Ok(fs::metadata(path)?.modified()?)
}

impl GeoResolver {
    /// Loads both databases. Failing to load either is fatal, per §4.4.
    pub fn load(city_path: PathBuf, asn_path: PathBuf) -> Result<Self> {
        let city = maxminddb::Reader::open_readfile(&city_path)
            .map_err(|e| MirrorbitsError::Geo(format!("loading city database: {e}")))?;
        let city_mtime = mtime_of(&city_path)?;
        let asn = maxminddb::Reader::open_readfile(&asn_path)
            .map_err(|e| MirrorbitsError::Geo(format!("loading ASN database: {e}")))?;
        let asn_mtime = mtime_of(&asn_path)?;
        info!(
            city = %city_path.display(),
            asn = %asn_path.display(),
            "geo databases loaded"
        );
        Ok(Self {
            city_path,
            asn_path,
            databases: RwLock::new(Databases {
                city,
                city_mtime,
                asn,
                asn_mtime,
            }),
        })
    }

    /// Reloads either database whose mtime has changed since the last load.
    /// A reload that observes identical timestamps is a no-op. A failure to
    /// load one database is logged and tolerated (partial reload).
    pub fn reload(&self) {
        let city_mtime = mtime_of(&self.city_path).ok();
        let asn_mtime = mtime_of(&self.asn_path).ok();

        let needs_city = city_mtime.is_some_and(|m| m != self.databases.read().city_mtime);
        let needs_asn = asn_mtime.is_some_and(|m| m != self.databases.read().asn_mtime);
        if !needs_city && !needs_asn {
            return;
        }

        let new_city = if needs_city {
            maxminddb::Reader::open_readfile(&self.city_path).ok()
        } else {
            None
        };
        let new_asn = if needs_asn {
            maxminddb::Reader::open_readfile(&self.asn_path).ok()
        } else {
            None
        };

        let mut databases = self.databases.write();
        if let (Some(city), Some(mtime)) = (new_city, city_mtime) {
            databases.city = city;
            databases.city_mtime = mtime;
            info!("reloaded city geo database");
        } else if needs_city {
            warn!("failed to reload city geo database; keeping previous copy");
        }
        if let (Some(asn), Some(mtime)) = (new_asn, asn_mtime) {
            databases.asn = asn;
            databases.asn_mtime = mtime;
            info!("reloaded ASN geo database");
        } else if needs_asn {
            warn!("failed to reload ASN geo database; keeping previous copy");
        }
    }

    /// Resolves an IP address to a [`ClientGeo`]. An empty country code
    /// (or a lookup miss) yields [`ClientGeo::Invalid`], never a
    /// partially-populated record.
    pub fn lookup(&self, ip: IpAddr) -> ClientGeo {
        let databases = self.databases.read();

        let city_record: Option<geoip2::City> = databases.city.lookup(ip).ok();
        let Some(city_record) = city_record else {
            return ClientGeo::Invalid;
        };

        let country_code = city_record
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .unwrap_or_default();
        if country_code.is_empty() {
            return ClientGeo::Invalid;
        }

        let continent_code = city_record
            .continent
            .as_ref()
            .and_then(|c| c.code)
            .unwrap_or_default()
            .to_string();
        let city_name = city_record
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en").copied())
            .unwrap_or("")
            .to_string();
        let country_name = city_record
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en").copied())
            .unwrap_or("")
            .to_string();
        let (latitude, longitude) = city_record
            .location
            .as_ref()
            .map(|loc| (loc.latitude.unwrap_or(0.0), loc.longitude.unwrap_or(0.0)))
            .unwrap_or((0.0, 0.0));

        let asn_record: Option<geoip2::Asn> = databases.asn.lookup(ip).ok();
        let (as_name, as_num) = asn_record
            .map(|r| {
                (
                    r.autonomous_system_organization
                        .unwrap_or_default()
                        .to_string(),
                    r.autonomous_system_number.unwrap_or(0),
                )
            })
            .unwrap_or_default();

        ClientGeo::Valid {
            country_code: country_code.to_string(),
            continent_code,
            city: city_name,
            country_name,
            latitude,
            longitude,
            as_name,
            as_num,
        }
    }
}
