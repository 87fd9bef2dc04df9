//! Error taxonomy for the collection pipeline.
//!
//! Fatal errors ([`ConfigError`], [`SourceError`], [`LoadError`], and the
//! storage failures that prevent a run from being opened or closed) surface
//! as [`CollectError`]. Per-probe failures never appear here: they are
//! recorded as an [`OutcomeKind`](crate::probes::OutcomeKind) on the result.

use std::path::PathBuf;

use thiserror::Error;

use crate::run::{RunId, RunStatus};

/// Top-level error returned by the collection orchestrator.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    EnrichmentUnavailable(#[from] EnrichmentUnavailable),

    /// The run was opened but could not be closed. Its partial data is still
    /// readable under `run_id`.
    #[error("run {run_id} could not be finalized: {source}")]
    Finish {
        run_id: RunId,
        #[source]
        source: StorageError,
    },
}

impl CollectError {
    /// Identifier of the run this error belongs to, if one was created.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            CollectError::Finish { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

/// Invalid or incomplete configuration. Always detected before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("at least one DNS server must be configured")]
    NoServers,

    #[error("invalid DNS server address '{0}'")]
    InvalidServer(String),

    #[error("concurrency must be at least 1 (got {0})")]
    InvalidConcurrency(usize),

    #[error("unsupported query type '{0}' (expected A or AAAA)")]
    InvalidQueryType(String),

    #[error("{0}")]
    Invalid(String),
}

/// The target list could not be opened or read.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open target list {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed reading target list at line {line}: {reason}")]
    Read { line: usize, reason: String },
}

/// An explicitly configured input file (exclusion list, GeoIP database)
/// could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read exclusion list {path}: {source}")]
    ExclusionRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid exclusion entry '{entry}' on line {line}")]
    ExclusionEntry { line: usize, entry: String },

    #[error("cannot load GeoIP database {path}: {reason}")]
    GeoIp { path: PathBuf, reason: String },
}

/// Failure in the run store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode run configuration: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cannot create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {run_id} is already {status}; no further writes accepted")]
    RunClosed { run_id: RunId, status: RunStatus },

    #[error("run {run_id} cannot be finished as {status}")]
    InvalidTransition { run_id: RunId, status: RunStatus },

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// The enrichment databases were never loaded (or have been closed).
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("enrichment databases are not loaded")]
pub struct EnrichmentUnavailable;
