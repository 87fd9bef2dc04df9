//! MaxMind GeoLite2 Country + ASN databases.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::{geoip2, MaxMindDBError, Reader};
use tracing::{debug, info};

use super::{Enricher, Enrichment, EnrichmentRecord, EnrichmentUnavailable};
use crate::config::GeoIpConfig;
use crate::error::LoadError;

/// Both readers are memory-resident and read-only after open.
pub struct MaxMindEnricher {
    country: Reader<Vec<u8>>,
    asn: Reader<Vec<u8>>,
}

impl MaxMindEnricher {
    pub fn open(config: &GeoIpConfig) -> Result<Self, LoadError> {
        let country_path = config.path.join(&config.country_filename);
        let asn_path = config.path.join(&config.asn_filename);

        let has_key = config.license_key.as_deref().is_some_and(|k| !k.is_empty());
        let country = open_reader(&country_path, "Country", has_key)?;
        let asn = open_reader(&asn_path, "ASN", has_key)?;

        info!(
            country = %country_path.display(),
            asn = %asn_path.display(),
            "loaded GeoIP databases"
        );
        Ok(Self { country, asn })
    }

    fn country_code(&self, address: IpAddr) -> Option<String> {
        match self.country.lookup::<geoip2::Country>(address) {
            Ok(c) => c.country.and_then(|c| c.iso_code).map(str::to_string),
            Err(MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(e) => {
                debug!(%address, error = %e, "country lookup failed");
                None
            }
        }
    }

    fn autonomous_system(&self, address: IpAddr) -> (Option<u32>, Option<String>) {
        match self.asn.lookup::<geoip2::Asn>(address) {
            Ok(a) => (
                a.autonomous_system_number,
                a.autonomous_system_organization.map(str::to_string),
            ),
            Err(MaxMindDBError::AddressNotFoundError(_)) => (None, None),
            Err(e) => {
                debug!(%address, error = %e, "ASN lookup failed");
                (None, None)
            }
        }
    }
}

impl Enricher for MaxMindEnricher {
    fn lookup(&self, address: IpAddr) -> Result<Enrichment, EnrichmentUnavailable> {
        let country_code = self.country_code(address);
        let (asn, as_name) = self.autonomous_system(address);

        if country_code.is_none() && asn.is_none() && as_name.is_none() {
            return Ok(Enrichment::NotFound);
        }
        Ok(Enrichment::Found(EnrichmentRecord {
            address,
            country_code,
            asn,
            as_name,
        }))
    }
}

fn open_reader(path: &Path, kind: &str, has_key: bool) -> Result<Reader<Vec<u8>>, LoadError> {
    let reader = Reader::open_readfile(path).map_err(|e| {
        let mut reason = e.to_string();
        if !path.exists() && has_key {
            reason.push_str(" (fetch it with geoipupdate using the configured license key)");
        }
        LoadError::GeoIp {
            path: path.to_path_buf(),
            reason,
        }
    })?;

    // Catch swapped filenames early.
    if !reader.metadata.database_type.contains(kind) {
        return Err(LoadError::GeoIp {
            path: path.to_path_buf(),
            reason: format!(
                "expected a {kind} database, found '{}'",
                reader.metadata.database_type
            ),
        });
    }
    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_database_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = GeoIpConfig {
            path: dir.path().to_path_buf(),
            license_key: Some("abc123".to_string()),
            ..GeoIpConfig::default()
        };
        let err = MaxMindEnricher::open(&config).err().expect("no databases on disk");
        match err {
            LoadError::GeoIp { path, reason } => {
                assert_eq!(path, dir.path().join("GeoLite2-Country.mmdb"));
                assert!(reason.contains("geoipupdate"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_database_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("GeoLite2-Country.mmdb"), b"not a database").unwrap();
        let config = GeoIpConfig {
            path: PathBuf::from(dir.path()),
            ..GeoIpConfig::default()
        };
        let err = MaxMindEnricher::open(&config).err().expect("corrupt file");
        assert!(matches!(err, LoadError::GeoIp { .. }));
    }
}
