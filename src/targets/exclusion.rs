//! Opt-out list of targets that must never be probed.
//!
//! Format:
//! - One entry per line
//! - Lines starting with # are comments
//! - Empty lines are ignored
//! - Names: `example.com` (also covers every subdomain)
//! - IP addresses: `192.0.2.1`
//! - CIDR blocks: `198.51.100.0/24`

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use tracing::info;

use super::Target;
use crate::error::LoadError;

/// Membership test applied to every target before it enters the pipeline.
pub trait ExclusionFilter: Send + Sync {
    fn is_excluded(&self, target: &Target) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    base: IpAddr,
    prefix: u8,
}

impl Network {
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let base: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = if base.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { base, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.base, ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(base) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(base) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// In-memory exclusion set.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    names: HashSet<String>,
    addresses: HashSet<IpAddr>,
    networks: Vec<Network>,
}

impl ExclusionList {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load an explicitly configured list. A missing or unreadable file is
    /// an error.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::ExclusionRead {
            path: path.to_path_buf(),
            source,
        })?;
        let list = Self::parse(&content)?;
        info!(path = %path.display(), entries = list.len(), "loaded exclusion list");
        Ok(list)
    }

    /// Load the list if a path was configured, otherwise return an empty set.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, LoadError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::empty()),
        }
    }

    pub fn parse(content: &str) -> Result<Self, LoadError> {
        let mut list = Self::empty();

        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if trimmed.contains('/') {
                let network = Network::parse(trimmed).ok_or_else(|| LoadError::ExclusionEntry {
                    line: line_num + 1,
                    entry: trimmed.to_string(),
                })?;
                list.networks.push(network);
                continue;
            }

            match Target::parse(trimmed) {
                Ok(target) => match target.address() {
                    Some(ip) => {
                        list.addresses.insert(ip);
                    }
                    None => {
                        list.names.insert(target.as_str().to_string());
                    }
                },
                Err(_) => {
                    return Err(LoadError::ExclusionEntry {
                        line: line_num + 1,
                        entry: trimmed.to_string(),
                    })
                }
            }
        }

        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.names.len() + self.addresses.len() + self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExclusionFilter for ExclusionList {
    fn is_excluded(&self, target: &Target) -> bool {
        if let Some(ip) = target.address() {
            return self.addresses.contains(&ip) || self.networks.iter().any(|n| n.contains(ip));
        }

        // The name itself, then each parent domain.
        let mut name = target.as_str();
        loop {
            if self.names.contains(name) {
                return true;
            }
            match name.split_once('.') {
                Some((_, parent)) => name = parent,
                None => return false,
            }
        }
    }
}
