//! Probe results and the per-target probe worker.

pub mod dns;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::enrich::{Enricher, Enrichment};
use crate::targets::Target;
use dns::{DnsTransport, QueryType};

/// How a single (target, server) probe ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Resolved,
    NxDomain,
    Timeout,
    ServerError,
    MalformedResponse,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Resolved => "resolved",
            OutcomeKind::NxDomain => "nxdomain",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::ServerError => "server-error",
            OutcomeKind::MalformedResponse => "malformed-response",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resolved" => Ok(OutcomeKind::Resolved),
            "nxdomain" => Ok(OutcomeKind::NxDomain),
            "timeout" => Ok(OutcomeKind::Timeout),
            "server-error" => Ok(OutcomeKind::ServerError),
            "malformed-response" => Ok(OutcomeKind::MalformedResponse),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// A resolved address with whatever enrichment was available for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAddress {
    pub address: IpAddr,
    /// `None` when no enrichment engine was available.
    pub enrichment: Option<Enrichment>,
}

/// One probe of one target against one server.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub target: String,
    pub server: SocketAddr,
    pub outcome: OutcomeKind,
    pub addresses: Vec<ResolvedAddress>,
    pub rtt: Duration,
    pub error: Option<String>,
    /// Raw response bytes, kept only in debug mode.
    #[serde(skip)]
    pub raw_response: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

/// Static probe parameters shared by every worker in a run.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub servers: Arc<[SocketAddr]>,
    pub timeout: Duration,
    pub query_type: QueryType,
    pub debug: bool,
    pub verbose: bool,
}

/// Probes one target against every configured server, in server order.
/// Per-server failures become outcomes; they never abort the target.
pub struct ProbeWorker {
    transport: Arc<dyn DnsTransport>,
    enricher: Option<Arc<dyn Enricher>>,
    settings: ProbeSettings,
}

impl ProbeWorker {
    pub fn new(
        transport: Arc<dyn DnsTransport>,
        enricher: Option<Arc<dyn Enricher>>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            transport,
            enricher,
            settings,
        }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.settings.servers
    }

    pub async fn probe(&self, target: &Target) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(self.settings.servers.len());
        for server in self.settings.servers.iter() {
            results.push(self.probe_server(target, *server).await);
        }

        let resolved = results
            .iter()
            .filter(|r| r.outcome == OutcomeKind::Resolved)
            .count();
        if self.settings.verbose {
            info!(%target, servers = results.len(), resolved, "probed target");
        } else {
            debug!(%target, servers = results.len(), resolved, "probed target");
        }
        results
    }

    async fn probe_server(&self, target: &Target, server: SocketAddr) -> ProbeResult {
        let timestamp = Utc::now();
        let start = Instant::now();

        let query = match dns::build_query(target, self.settings.query_type) {
            Ok(q) => q,
            Err(e) => {
                warn!(%target, %server, error = %e, "could not encode query");
                return ProbeResult {
                    target: target.to_string(),
                    server,
                    outcome: OutcomeKind::ServerError,
                    addresses: Vec::new(),
                    rtt: Duration::ZERO,
                    error: Some(format!("query encoding failed: {e}")),
                    raw_response: None,
                    timestamp,
                };
            }
        };

        let exchange = self
            .transport
            .exchange(server, &query.bytes, self.settings.timeout)
            .await;
        let rtt = start.elapsed();

        let (classified, raw_response) = match exchange {
            Ok(raw) => {
                let classified = dns::classify_response(&query, &raw);
                (classified, self.settings.debug.then_some(raw))
            }
            Err(e) => (dns::classify_error(&e), None),
        };
        debug!(%target, %server, outcome = %classified.outcome, rtt_ms = rtt.as_millis() as u64, "probe finished");

        let addresses = classified
            .addresses
            .into_iter()
            .map(|address| ResolvedAddress {
                address,
                enrichment: self.enrich(address),
            })
            .collect();

        ProbeResult {
            target: target.to_string(),
            server,
            outcome: classified.outcome,
            addresses,
            rtt,
            error: classified.detail,
            raw_response,
            timestamp,
        }
    }

    fn enrich(&self, address: IpAddr) -> Option<Enrichment> {
        let enricher = self.enricher.as_ref()?;
        match enricher.lookup(address) {
            Ok(enrichment) => Some(enrichment),
            Err(e) => {
                debug!(%address, error = %e, "enrichment skipped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{EnrichmentRecord, EnrichmentUnavailable};
    use crate::probes::dns::TransportError;
    use trust_dns_resolver::proto::op::{Message, MessageType, ResponseCode};
    use trust_dns_resolver::proto::rr::rdata::A;
    use trust_dns_resolver::proto::rr::{RData, Record};
    use trust_dns_resolver::proto::serialize::binary::BinEncodable;

    /// Answers every query with 192.0.2.1, except on the "dead" server.
    struct ScriptedTransport {
        dead: SocketAddr,
    }

    #[async_trait::async_trait]
    impl DnsTransport for ScriptedTransport {
        async fn exchange(
            &self,
            server: SocketAddr,
            query: &[u8],
            timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            if server == self.dead {
                return Err(TransportError::Timeout(timeout));
            }
            let mut msg = Message::from_vec(query).unwrap();
            let name = msg.queries()[0].name().clone();
            msg.set_message_type(MessageType::Response)
                .set_response_code(ResponseCode::NoError);
            msg.add_answer(Record::from_rdata(name, 60, RData::A(A("192.0.2.1".parse().unwrap()))));
            Ok(msg.to_vec().unwrap())
        }
    }

    struct CountryOnly;

    impl Enricher for CountryOnly {
        fn lookup(&self, address: IpAddr) -> Result<Enrichment, EnrichmentUnavailable> {
            Ok(Enrichment::Found(EnrichmentRecord {
                address,
                country_code: Some("CL".to_string()),
                asn: None,
                as_name: None,
            }))
        }
    }

    struct Unloaded;

    impl Enricher for Unloaded {
        fn lookup(&self, _: IpAddr) -> Result<Enrichment, EnrichmentUnavailable> {
            Err(EnrichmentUnavailable)
        }
    }

    fn worker(enricher: Option<Arc<dyn Enricher>>, debug: bool) -> ProbeWorker {
        let servers: Vec<SocketAddr> = vec![
            "192.0.2.53:53".parse().unwrap(),
            "198.51.100.53:53".parse().unwrap(),
        ];
        ProbeWorker::new(
            Arc::new(ScriptedTransport { dead: servers[1] }),
            enricher,
            ProbeSettings {
                servers: servers.into(),
                timeout: Duration::from_millis(100),
                query_type: QueryType::A,
                debug,
                verbose: false,
            },
        )
    }

    #[tokio::test]
    async fn test_one_result_per_server_in_order() {
        let w = worker(None, false);
        let target = Target::parse("a.example").unwrap();
        let results = w.probe(&target).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].server, w.servers()[0]);
        assert_eq!(results[1].server, w.servers()[1]);
        assert_eq!(results[0].outcome, OutcomeKind::Resolved);
        assert_eq!(results[1].outcome, OutcomeKind::Timeout);
        assert!(results[1].error.is_some());
        assert!(results.iter().all(|r| r.target == "a.example"));
    }

    #[tokio::test]
    async fn test_addresses_are_enriched() {
        let w = worker(Some(Arc::new(CountryOnly)), false);
        let results = w.probe(&Target::parse("a.example").unwrap()).await;
        let addr = &results[0].addresses[0];

        assert_eq!(addr.address, "192.0.2.1".parse::<IpAddr>().unwrap());
        let record = addr.enrichment.as_ref().and_then(|e| e.record()).unwrap();
        assert_eq!(record.country_code.as_deref(), Some("CL"));
    }

    #[tokio::test]
    async fn test_unavailable_enrichment_keeps_address() {
        let w = worker(Some(Arc::new(Unloaded)), false);
        let results = w.probe(&Target::parse("a.example").unwrap()).await;
        assert_eq!(results[0].addresses.len(), 1);
        assert_eq!(results[0].addresses[0].enrichment, None);
    }

    #[tokio::test]
    async fn test_debug_mode_keeps_raw_response() {
        let target = Target::parse("a.example").unwrap();

        let plain = worker(None, false).probe(&target).await;
        assert!(plain[0].raw_response.is_none());

        let debug = worker(None, true).probe(&target).await;
        assert!(debug[0].raw_response.as_ref().is_some_and(|raw| raw.len() > 12));
        assert!(debug[1].raw_response.is_none());
    }

    #[test]
    fn test_outcome_text_round_trip() {
        for kind in [
            OutcomeKind::Resolved,
            OutcomeKind::NxDomain,
            OutcomeKind::Timeout,
            OutcomeKind::ServerError,
            OutcomeKind::MalformedResponse,
        ] {
            assert_eq!(kind.as_str().parse::<OutcomeKind>().unwrap(), kind);
        }
    }
}
