//! TOML configuration for a collection run.
//!
//! The file path comes from `--config` (or `DNSCENSUS_CONFIG`, resolved by
//! the CLI), else `dnscensus.toml` in the working directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::probes::dns::{parse_server, QueryType};

pub const DEFAULT_CONFIG_FILE: &str = "dnscensus.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Enrichment is disabled when this section is absent.
    #[serde(default)]
    pub geoip: Option<GeoIpConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// The explicit path if one was given, else the default file name.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Check everything that must hold before a run may start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run.servers()?;
        self.run.query_type()?;
        if self.run.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(0));
        }
        if self.run.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "query_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.run.channel_factor == 0 {
            return Err(ConfigError::Invalid(
                "channel_factor must be greater than zero".to_string(),
            ));
        }
        if self.run.input_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("input_path must be set".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Collection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Target list, one name or address per line.
    pub input_path: PathBuf,
    /// Opt-out list. When set, the file must exist.
    pub exclusion_path: Option<PathBuf>,
    /// Log each probed target at info level.
    pub verbose: bool,
    /// Store raw DNS responses.
    pub debug: bool,
    /// Number of targets probed at once.
    pub concurrency: usize,
    /// Destroy all previous runs before starting.
    pub drop_database: bool,
    /// Resolvers to query, as `ip` or `ip:port`.
    pub dns_servers: Vec<String>,
    pub query_timeout_ms: u64,
    /// `A` or `AAAA`.
    pub query_type: String,
    /// Results buffered between probing and storage, as a multiple of
    /// `concurrency`.
    pub channel_factor: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("targets.txt"),
            exclusion_path: None,
            verbose: false,
            debug: false,
            concurrency: 50,
            drop_database: false,
            dns_servers: Vec::new(),
            query_timeout_ms: 2000,
            query_type: "A".to_string(),
            channel_factor: 2,
        }
    }
}

impl RunConfig {
    pub fn servers(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        if self.dns_servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        self.dns_servers
            .iter()
            .map(|s| parse_server(s).ok_or_else(|| ConfigError::InvalidServer(s.clone())))
            .collect()
    }

    pub fn query_type(&self) -> Result<QueryType, ConfigError> {
        self.query_type
            .parse()
            .map_err(ConfigError::InvalidQueryType)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; parent directories are created on open.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/dnscensus.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// GeoIP
// ---------------------------------------------------------------------------

/// MaxMind GeoLite2 database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIpConfig {
    /// Directory holding the database files.
    pub path: PathBuf,
    pub country_filename: String,
    pub asn_filename: String,
    /// MaxMind license key, used by `geoipupdate` to fetch the files.
    pub license_key: Option<String>,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("geoip"),
            country_filename: "GeoLite2-Country.mmdb".to_string(),
            asn_filename: "GeoLite2-ASN.mmdb".to_string(),
            license_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.run.concurrency, 50);
        assert_eq!(cfg.run.query_timeout_ms, 2000);
        assert_eq!(cfg.run.query_type, "A");
        assert_eq!(cfg.run.channel_factor, 2);
        assert!(!cfg.run.drop_database);
        assert!(cfg.run.exclusion_path.is_none());
        assert_eq!(cfg.database.path, PathBuf::from("data/dnscensus.db"));
        assert!(cfg.geoip.is_none());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[run]
input_path = "lists/top1m.csv"
exclusion_path = "lists/optout.txt"
verbose = true
debug = true
concurrency = 200
drop_database = true
dns_servers = ["8.8.8.8", "1.1.1.1:53", "2606:4700:4700::1111"]
query_timeout_ms = 1500
query_type = "AAAA"

[database]
path = "/var/lib/dnscensus/runs.db"

[geoip]
path = "/usr/share/GeoIP"
license_key = "secret"

[logging]
level = "debug"
json = true
"#;

        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.run.input_path, PathBuf::from("lists/top1m.csv"));
        assert_eq!(cfg.run.exclusion_path, Some(PathBuf::from("lists/optout.txt")));
        assert!(cfg.run.verbose);
        assert!(cfg.run.debug);
        assert_eq!(cfg.run.concurrency, 200);
        assert!(cfg.run.drop_database);
        assert_eq!(cfg.run.query_type().unwrap(), QueryType::Aaaa);
        assert_eq!(cfg.run.query_timeout(), Duration::from_millis(1500));

        let servers = cfg.run.servers().unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0], "8.8.8.8:53".parse().unwrap());
        assert_eq!(servers[2], "[2606:4700:4700::1111]:53".parse().unwrap());

        let geoip = cfg.geoip.unwrap();
        assert_eq!(geoip.path, PathBuf::from("/usr/share/GeoIP"));
        assert_eq!(geoip.country_filename, "GeoLite2-Country.mmdb");
        assert_eq!(geoip.license_key.as_deref(), Some("secret"));
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str("[run]\ndns_servers = [\"9.9.9.9\"]\n").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.run.concurrency, 50);
        assert_eq!(cfg.database.path, PathBuf::from("data/dnscensus.db"));
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoServers)));
    }

    #[test]
    fn test_bad_server_rejected() {
        let mut cfg = Config::default();
        cfg.run.dns_servers = vec!["8.8.8.8".to_string(), "resolver.local".to_string()];
        match cfg.validate() {
            Err(ConfigError::InvalidServer(s)) => assert_eq!(s, "resolver.local"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut cfg = Config::default();
        cfg.run.dns_servers = vec!["8.8.8.8".to_string()];
        cfg.run.concurrency = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConcurrency(0))));
    }

    #[test]
    fn test_unknown_query_type_rejected() {
        let mut cfg = Config::default();
        cfg.run.dns_servers = vec!["8.8.8.8".to_string()];
        cfg.run.query_type = "MX".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidQueryType(_))));
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        let p = Config::locate(Some(Path::new("/etc/dnscensus/custom.toml")));
        assert_eq!(p, PathBuf::from("/etc/dnscensus/custom.toml"));
        assert_eq!(Config::locate(None), PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/dnscensus.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[run\nconcurrency = ").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
