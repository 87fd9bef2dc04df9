//! Probe targets and the lazy target list reader.
//!
//! Input format, one target per line:
//! - Lines starting with `#` are comments
//! - Empty lines are ignored
//! - `example.com`, `example.com.` and `192.0.2.1` are plain targets
//! - `1,example.com` (ranked top-list CSV): the second field is the target,
//!   anything after it is ignored
//!
//! Invalid lines, including lines that are not UTF-8, are skipped with a
//! warning and counted; they never abort the run.

pub mod exclusion;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::SourceError;
pub use exclusion::{ExclusionFilter, ExclusionList};

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidTarget {
    #[error("empty target")]
    Empty,
    #[error("name exceeds {MAX_NAME_LEN} characters")]
    TooLong,
    #[error("label '{0}' is empty or exceeds {MAX_LABEL_LEN} characters")]
    BadLabelLength(String),
    #[error("label '{0}' contains characters outside [a-z0-9-_]")]
    BadCharacter(String),
    #[error("label '{0}' starts or ends with a hyphen")]
    Hyphen(String),
}

/// A name or address to be probed. Normalized to lower case without a
/// trailing dot, so equal targets compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    name: String,
    address: Option<IpAddr>,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, InvalidTarget> {
        let trimmed = raw.trim();
        if let Ok(address) = trimmed.parse::<IpAddr>() {
            return Ok(Self {
                name: address.to_string(),
                address: Some(address),
            });
        }

        let name = trimmed.strip_suffix('.').unwrap_or(trimmed).to_ascii_lowercase();
        validate_name(&name)?;
        Ok(Self {
            name,
            address: None,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The address, if this target is an IP literal rather than a name.
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn validate_name(name: &str) -> Result<(), InvalidTarget> {
    if name.is_empty() {
        return Err(InvalidTarget::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(InvalidTarget::TooLong);
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(InvalidTarget::BadLabelLength(label.to_string()));
        }
        // Underscores show up in service names (_dmarc, _domainkey).
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        {
            return Err(InvalidTarget::BadCharacter(label.to_string()));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(InvalidTarget::Hyphen(label.to_string()));
        }
    }
    Ok(())
}

/// Counters kept while a [`TargetSource`] is consumed.
#[derive(Debug, Default)]
pub struct SourceStats {
    yielded: AtomicU64,
    skipped: AtomicU64,
    excluded: AtomicU64,
    read_error: OnceLock<String>,
}

/// Point-in-time copy of [`SourceStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCounts {
    pub yielded: u64,
    pub skipped: u64,
    pub excluded: u64,
    pub read_error: Option<String>,
}

impl SourceStats {
    pub fn snapshot(&self) -> SourceCounts {
        SourceCounts {
            yielded: self.yielded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
            read_error: self.read_error.get().cloned(),
        }
    }
}

/// Lazy, finite sequence of targets read from a list. Restart by opening
/// the list again.
pub struct TargetSource<R> {
    reader: R,
    buf: Vec<u8>,
    line_no: usize,
    filter: Arc<dyn ExclusionFilter>,
    stats: Arc<SourceStats>,
    done: bool,
}

impl TargetSource<BufReader<File>> {
    pub fn open(path: &Path, filter: Arc<dyn ExclusionFilter>) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "opened target list");
        Ok(Self::from_reader(BufReader::new(file), filter))
    }
}

impl<R: BufRead> TargetSource<R> {
    pub fn from_reader(reader: R, filter: Arc<dyn ExclusionFilter>) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_no: 0,
            filter,
            stats: Arc::new(SourceStats::default()),
            done: false,
        }
    }

    /// Shared handle to the counters; stays valid after the source is moved
    /// into the dispatcher.
    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }
}

impl<R: BufRead> Iterator for TargetSource<R> {
    type Item = Target;

    fn next(&mut self) -> Option<Target> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    let err = SourceError::Read {
                        line: self.line_no + 1,
                        reason: e.to_string(),
                    };
                    warn!(error = %err, "target list read failed; stopping");
                    let _ = self.stats.read_error.set(err.to_string());
                    self.done = true;
                    return None;
                }
            }
            self.line_no += 1;

            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line,
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "skipping line that is not UTF-8");
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let field = match trimmed.split_once(',') {
                Some((_rank, rest)) => rest.split(',').next().unwrap_or(rest),
                None => trimmed,
            };

            let target = match Target::parse(field) {
                Ok(t) => t,
                Err(e) => {
                    warn!(line = self.line_no, entry = %trimmed, error = %e, "skipping invalid target");
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            if self.filter.is_excluded(&target) {
                debug!(line = self.line_no, target = %target, "target excluded");
                self.stats.excluded.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.stats.yielded.fetch_add(1, Ordering::Relaxed);
            return Some(target);
        }
        None
    }
}
