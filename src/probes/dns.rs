//! DNS wire queries: encoding, UDP exchange, and response classification.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use trust_dns_resolver::proto::error::ProtoError;
use trust_dns_resolver::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_resolver::proto::rr::{Name, RData, RecordType};

use super::OutcomeKind;
use crate::targets::Target;

/// Largest UDP response accepted (EDNS-sized).
const MAX_RESPONSE: usize = 4096;

/// Record type asked for name targets. Address targets always get PTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Aaaa,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::A => "A",
            QueryType::Aaaa => "AAAA",
        }
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(QueryType::A),
            "AAAA" => Ok(QueryType::Aaaa),
            other => Err(other.to_string()),
        }
    }
}

/// An encoded query, ready to send.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub name: Name,
    pub record_type: RecordType,
    pub bytes: Vec<u8>,
}

pub fn build_query(target: &Target, query_type: QueryType) -> Result<DnsQuery, ProtoError> {
    let (name, record_type) = match target.address() {
        Some(ip) => (Name::from(ip), RecordType::PTR),
        None => {
            let record_type = match query_type {
                QueryType::A => RecordType::A,
                QueryType::Aaaa => RecordType::AAAA,
            };
            (Name::from_ascii(format!("{}.", target.as_str()))?, record_type)
        }
    };

    let id: u16 = rand::random();
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name.clone(), record_type));

    Ok(DnsQuery {
        id,
        name,
        record_type,
        bytes: message.to_vec()?,
    })
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends one encoded query to one server and returns the raw response.
#[async_trait::async_trait]
pub trait DnsTransport: Send + Sync {
    async fn exchange(
        &self,
        server: SocketAddr,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Plain DNS over UDP, one ephemeral socket per exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

#[async_trait::async_trait]
impl DnsTransport for UdpTransport {
    async fn exchange(
        &self,
        server: SocketAddr,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let bind: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let exchange = async {
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(server).await?;
            socket.send(query).await?;
            let mut buf = vec![0u8; MAX_RESPONSE];
            let len = socket.recv(&mut buf).await?;
            buf.truncate(len);
            Ok::<_, std::io::Error>(buf)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Classified response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub outcome: OutcomeKind,
    pub addresses: Vec<IpAddr>,
    pub detail: Option<String>,
}

impl Classified {
    fn new(outcome: OutcomeKind, detail: Option<String>) -> Self {
        Self {
            outcome,
            addresses: Vec::new(),
            detail,
        }
    }
}

/// Map a transport failure onto an outcome.
pub fn classify_error(err: &TransportError) -> Classified {
    match err {
        TransportError::Timeout(_) => Classified::new(OutcomeKind::Timeout, Some(err.to_string())),
        TransportError::Io(_) => Classified::new(OutcomeKind::ServerError, Some(err.to_string())),
    }
}

/// Map a raw response onto an outcome, extracting A/AAAA answers.
pub fn classify_response(query: &DnsQuery, response: &[u8]) -> Classified {
    let message = match Message::from_vec(response) {
        Ok(m) => m,
        Err(e) => {
            return Classified::new(
                OutcomeKind::MalformedResponse,
                Some(format!("undecodable response: {e}")),
            )
        }
    };

    if message.message_type() != MessageType::Response {
        return Classified::new(
            OutcomeKind::MalformedResponse,
            Some("reply is not a response".to_string()),
        );
    }
    if message.id() != query.id {
        return Classified::new(
            OutcomeKind::MalformedResponse,
            Some(format!("id mismatch: sent {}, got {}", query.id, message.id())),
        );
    }

    match message.response_code() {
        ResponseCode::NoError => {
            let addresses = message
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect();
            let detail = message
                .truncated()
                .then(|| "response truncated".to_string());
            Classified {
                outcome: OutcomeKind::Resolved,
                addresses,
                detail,
            }
        }
        ResponseCode::NXDomain => Classified::new(OutcomeKind::NxDomain, None),
        code => Classified::new(OutcomeKind::ServerError, Some(format!("rcode {code}"))),
    }
}

/// Parse `ip` or `ip:port` (bracketed for IPv6), defaulting to port 53.
pub fn parse_server(s: &str) -> Option<SocketAddr> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    s.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
}
