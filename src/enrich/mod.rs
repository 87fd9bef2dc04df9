//! Geographic and network-ownership metadata for resolved addresses.

pub mod maxmind;

use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;

pub use crate::error::EnrichmentUnavailable;
pub use maxmind::MaxMindEnricher;

/// Country and autonomous-system data for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichmentRecord {
    pub address: IpAddr,
    pub country_code: Option<String>,
    pub asn: Option<u32>,
    pub as_name: Option<String>,
}

/// Result of a lookup. A miss is a normal, recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Enrichment {
    Found(EnrichmentRecord),
    NotFound,
}

impl Enrichment {
    pub fn record(&self) -> Option<&EnrichmentRecord> {
        match self {
            Enrichment::Found(r) => Some(r),
            Enrichment::NotFound => None,
        }
    }
}

/// Local (non-network) lookup engine. Implementations must be safe for
/// concurrent reads and return the same answer for the same address.
pub trait Enricher: Send + Sync {
    fn lookup(&self, address: IpAddr) -> Result<Enrichment, EnrichmentUnavailable>;

    /// Fails if the databases are not usable. A loaded database answers
    /// loopback with `NotFound`.
    fn check(&self) -> Result<(), EnrichmentUnavailable> {
        self.lookup(IpAddr::V4(Ipv4Addr::LOCALHOST)).map(|_| ())
    }
}
