//! SQLite run store -- schema, run lifecycle, result persistence.

pub mod schema;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::probes::{OutcomeKind, ProbeResult};
use crate::run::{ConfigSnapshot, OutcomeCounts, RunId, RunStatus, RunSummary, RunTally};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool, StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StorageError::Directory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    debug!(path = %path.display(), "run store ready");

    Ok(pool)
}

/// Persistence contract for one measurement run.
///
/// `append` may be called concurrently. Once a run is finished no further
/// results are accepted for it.
pub trait RunRecorder: Send + Sync {
    fn begin(&self, snapshot: &ConfigSnapshot) -> Result<RunId, StorageError>;
    fn append(&self, run_id: RunId, result: &ProbeResult) -> Result<(), StorageError>;
    fn finish(&self, run_id: RunId, status: RunStatus, tally: &RunTally) -> Result<(), StorageError>;
    /// Destroy all stored runs. Returns how many runs were dropped.
    fn reset(&self) -> Result<u64, StorageError>;
}

/// A stored probe result, as read back for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub id: i64,
    pub target: String,
    pub server: String,
    pub outcome: OutcomeKind,
    pub rtt_us: i64,
    pub error: Option<String>,
    pub raw_response: Option<Vec<u8>>,
    pub addresses: Vec<StoredAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAddress {
    pub address: String,
    pub enriched: bool,
    pub country_code: Option<String>,
    pub asn: Option<u32>,
    pub as_name: Option<String>,
}

/// [`RunRecorder`] over a pooled SQLite database in WAL mode.
#[derive(Clone)]
pub struct SqliteRecorder {
    pool: Pool,
}

impl SqliteRecorder {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    fn status_of(conn: &rusqlite::Connection, run_id: RunId) -> Result<RunStatus, StorageError> {
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", [run_id], |row| row.get(0))
            .optional()?;
        let status = status.ok_or(StorageError::RunNotFound(run_id))?;
        status.parse().map_err(|reason| StorageError::Corrupt {
            table: "runs",
            reason,
        })
    }

    pub fn run_summary(&self, run_id: RunId) -> Result<RunSummary, StorageError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT tag, status, config_json, started_at, finished_at,
                        targets_probed, targets_skipped, targets_excluded,
                        results_written, results_failed,
                        resolved, nxdomain, timeout, server_error, malformed_response
                 FROM runs WHERE id = ?1",
                [run_id],
                |row| {
                    Ok(RunRow {
                        tag: row.get(0)?,
                        status: row.get(1)?,
                        config_json: row.get(2)?,
                        started_at: row.get(3)?,
                        finished_at: row.get(4)?,
                        counters: [
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                            row.get(12)?,
                            row.get(13)?,
                            row.get(14)?,
                        ],
                    })
                },
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))?;

        row.into_summary(run_id)
    }

    /// All runs, oldest first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>, StorageError> {
        let ids: Vec<RunId> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare("SELECT id FROM runs ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let ids = rows.collect::<Result<Vec<RunId>, _>>()?;
            ids
        };
        ids.into_iter().map(|id| self.run_summary(id)).collect()
    }

    pub fn count_results(&self, run_id: RunId) -> Result<u64, StorageError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM probe_results WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Every result of a run with its addresses, in insertion order.
    pub fn results(&self, run_id: RunId) -> Result<Vec<StoredResult>, StorageError> {
        let conn = self.pool.get()?;

        let mut addresses: HashMap<i64, Vec<StoredAddress>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT a.result_id, a.address, a.enriched, a.country_code, a.asn, a.as_name
                 FROM resolved_addresses a
                 JOIN probe_results r ON r.id = a.result_id
                 WHERE r.run_id = ?1
                 ORDER BY a.id",
            )?;
            let rows = stmt.query_map([run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    StoredAddress {
                        address: row.get(1)?,
                        enriched: row.get::<_, i64>(2)? != 0,
                        country_code: row.get(3)?,
                        asn: row.get(4)?,
                        as_name: row.get(5)?,
                    },
                ))
            })?;
            for r in rows {
                let (result_id, address) = r?;
                addresses.entry(result_id).or_default().push(address);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, target, server, outcome, rtt_us, error, raw_response
             FROM probe_results WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<Vec<u8>>>(6)?,
            ))
        })?;

        let mut results = Vec::new();
        for r in rows {
            let (id, target, server, outcome, rtt_us, error, raw_response) = r?;
            let outcome = outcome.parse().map_err(|reason| StorageError::Corrupt {
                table: "probe_results",
                reason,
            })?;
            results.push(StoredResult {
                id,
                target,
                server,
                outcome,
                rtt_us,
                error,
                raw_response,
                addresses: addresses.remove(&id).unwrap_or_default(),
            });
        }
        Ok(results)
    }
}

impl RunRecorder for SqliteRecorder {
    fn begin(&self, snapshot: &ConfigSnapshot) -> Result<RunId, StorageError> {
        let conn = self.pool.get()?;
        let config_json = serde_json::to_string(snapshot)?;
        let tag = Uuid::new_v4();

        conn.execute(
            "INSERT INTO runs (tag, status, config_json, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                tag.to_string(),
                RunStatus::InProgress.as_str(),
                config_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        let run_id = conn.last_insert_rowid();
        info!(run_id, %tag, "run started");
        Ok(run_id)
    }

    fn append(&self, run_id: RunId, result: &ProbeResult) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        // IMMEDIATE takes the write lock up front so concurrent appenders
        // wait on busy_timeout instead of failing on lock upgrade.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status = Self::status_of(&tx, run_id)?;
        if status.is_terminal() {
            return Err(StorageError::RunClosed { run_id, status });
        }

        let rtt_us = i64::try_from(result.rtt.as_micros()).unwrap_or(i64::MAX);
        tx.execute(
            "INSERT INTO probe_results
                (run_id, target, server, outcome, rtt_us, error, raw_response, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                result.target,
                result.server.to_string(),
                result.outcome.as_str(),
                rtt_us,
                result.error,
                result.raw_response,
                result.timestamp.to_rfc3339()
            ],
        )?;
        let result_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO resolved_addresses
                    (result_id, address, enriched, country_code, asn, as_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for addr in &result.addresses {
                let record = addr.enrichment.as_ref().and_then(|e| e.record());
                stmt.execute(params![
                    result_id,
                    addr.address.to_string(),
                    record.is_some(),
                    record.and_then(|r| r.country_code.as_deref()),
                    record.and_then(|r| r.asn),
                    record.and_then(|r| r.as_name.as_deref()),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn finish(&self, run_id: RunId, status: RunStatus, tally: &RunTally) -> Result<(), StorageError> {
        if !status.is_terminal() {
            return Err(StorageError::InvalidTransition { run_id, status });
        }

        let conn = self.pool.get()?;
        let o = &tally.outcomes;
        let changed = conn.execute(
            "UPDATE runs SET
                status = ?2, finished_at = ?3,
                targets_probed = ?4, targets_skipped = ?5, targets_excluded = ?6,
                results_written = ?7, results_failed = ?8,
                resolved = ?9, nxdomain = ?10, timeout = ?11,
                server_error = ?12, malformed_response = ?13
             WHERE id = ?1 AND status = 'in-progress'",
            params![
                run_id,
                status.as_str(),
                Utc::now().to_rfc3339(),
                tally.targets_probed as i64,
                tally.targets_skipped as i64,
                tally.targets_excluded as i64,
                tally.results_written as i64,
                tally.results_failed as i64,
                o.resolved as i64,
                o.nxdomain as i64,
                o.timeout as i64,
                o.server_error as i64,
                o.malformed_response as i64,
            ],
        )?;

        if changed == 0 {
            // Either unknown or already terminal.
            let current = Self::status_of(&conn, run_id)?;
            return Err(StorageError::RunClosed {
                run_id,
                status: current,
            });
        }
        info!(run_id, %status, results = tally.results_written, "run finished");
        Ok(())
    }

    fn reset(&self) -> Result<u64, StorageError> {
        let conn = self.pool.get()?;
        let dropped: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        schema::reset(&conn)?;
        warn!(dropped, "run store reset; all previous runs destroyed");
        Ok(dropped as u64)
    }
}

struct RunRow {
    tag: String,
    status: String,
    config_json: String,
    started_at: String,
    finished_at: Option<String>,
    counters: [i64; 10],
}

impl RunRow {
    fn into_summary(self, run_id: RunId) -> Result<RunSummary, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt {
            table: "runs",
            reason,
        };
        let parse_time = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp '{s}': {e}")))
        };

        let tag = Uuid::parse_str(&self.tag).map_err(|e| corrupt(e.to_string()))?;
        let status = self.status.parse().map_err(corrupt)?;
        let config: ConfigSnapshot = serde_json::from_str(&self.config_json)?;
        let started_at = parse_time(&self.started_at)?;
        let finished_at = self.finished_at.as_deref().map(parse_time).transpose()?;

        let c = self.counters.map(|v| v.max(0) as u64);
        Ok(RunSummary {
            run_id,
            tag,
            status,
            started_at,
            finished_at,
            config,
            tally: RunTally {
                targets_probed: c[0],
                targets_skipped: c[1],
                targets_excluded: c[2],
                results_written: c[3],
                results_failed: c[4],
                outcomes: OutcomeCounts {
                    resolved: c[5],
                    nxdomain: c[6],
                    timeout: c[7],
                    server_error: c[8],
                    malformed_response: c[9],
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{Enrichment, EnrichmentRecord};
    use crate::probes::ResolvedAddress;
    use std::time::Duration;

    fn recorder() -> (tempfile::TempDir, SqliteRecorder) {
        let dir = tempfile::tempdir().unwrap();
        let rec = SqliteRecorder::open(&dir.path().join("runs.db")).unwrap();
        (dir, rec)
    }

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            input_path: "targets.txt".to_string(),
            exclusion_path: None,
            dns_servers: vec!["8.8.8.8:53".to_string()],
            concurrency: 4,
            query_timeout_ms: 2000,
            query_type: "A".to_string(),
            debug: false,
            verbose: false,
            enrichment: true,
        }
    }

    fn result(target: &str, outcome: OutcomeKind) -> ProbeResult {
        let address = "192.0.2.5".parse().unwrap();
        ProbeResult {
            target: target.to_string(),
            server: "8.8.8.8:53".parse().unwrap(),
            outcome,
            addresses: vec![
                ResolvedAddress {
                    address,
                    enrichment: Some(Enrichment::Found(EnrichmentRecord {
                        address,
                        country_code: Some("CL".to_string()),
                        asn: Some(27678),
                        as_name: Some("NIC Chile".to_string()),
                    })),
                },
                ResolvedAddress {
                    address: "198.51.100.5".parse().unwrap(),
                    enrichment: Some(Enrichment::NotFound),
                },
            ],
            rtt: Duration::from_micros(1500),
            error: None,
            raw_response: Some(vec![1, 2, 3]),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let (_dir, rec) = recorder();
        let a = rec.begin(&snapshot()).unwrap();
        let b = rec.begin(&snapshot()).unwrap();
        assert!(b > a);

        let summary = rec.run_summary(a).unwrap();
        assert_eq!(summary.status, RunStatus::InProgress);
        assert_eq!(summary.finished_at, None);
        assert_eq!(summary.config, snapshot());
        assert_ne!(summary.tag, rec.run_summary(b).unwrap().tag);
    }

    #[test]
    fn test_append_stores_result_and_addresses() {
        let (_dir, rec) = recorder();
        let run = rec.begin(&snapshot()).unwrap();
        rec.append(run, &result("a.example", OutcomeKind::Resolved)).unwrap();

        let stored = rec.results(run).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].target, "a.example");
        assert_eq!(stored[0].server, "8.8.8.8:53");
        assert_eq!(stored[0].outcome, OutcomeKind::Resolved);
        assert_eq!(stored[0].rtt_us, 1500);
        assert_eq!(stored[0].raw_response.as_deref(), Some(&[1u8, 2, 3][..]));

        let addrs = &stored[0].addresses;
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].enriched);
        assert_eq!(addrs[0].country_code.as_deref(), Some("CL"));
        assert_eq!(addrs[0].asn, Some(27678));
        assert!(!addrs[1].enriched);
        assert_eq!(addrs[1].country_code, None);
    }

    #[test]
    fn test_append_unknown_run_fails() {
        let (_dir, rec) = recorder();
        let err = rec.append(42, &result("a.example", OutcomeKind::Resolved)).unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound(42)));
    }

    #[test]
    fn test_no_writes_after_finish() {
        let (_dir, rec) = recorder();
        let run = rec.begin(&snapshot()).unwrap();
        rec.finish(run, RunStatus::Completed, &RunTally::default()).unwrap();

        let err = rec.append(run, &result("a.example", OutcomeKind::Resolved)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::RunClosed {
                status: RunStatus::Completed,
                ..
            }
        ));
        assert_eq!(rec.count_results(run).unwrap(), 0);
    }

    #[test]
    fn test_status_never_moves_backward() {
        let (_dir, rec) = recorder();
        let run = rec.begin(&snapshot()).unwrap();
        rec.finish(run, RunStatus::Failed, &RunTally::default()).unwrap();

        let again = rec.finish(run, RunStatus::Completed, &RunTally::default());
        assert!(matches!(again, Err(StorageError::RunClosed { .. })));
        assert_eq!(rec.run_summary(run).unwrap().status, RunStatus::Failed);

        let reopen = rec.finish(run, RunStatus::InProgress, &RunTally::default());
        assert!(matches!(reopen, Err(StorageError::InvalidTransition { .. })));
    }

    #[test]
    fn test_finish_records_tally() {
        let (_dir, rec) = recorder();
        let run = rec.begin(&snapshot()).unwrap();
        let mut tally = RunTally {
            targets_probed: 2,
            targets_skipped: 1,
            targets_excluded: 3,
            results_written: 4,
            results_failed: 0,
            outcomes: OutcomeCounts::default(),
        };
        tally.outcomes.record(OutcomeKind::Resolved);
        tally.outcomes.record(OutcomeKind::ServerError);
        rec.finish(run, RunStatus::Completed, &tally).unwrap();

        let summary = rec.run_summary(run).unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(summary.finished_at.is_some());
        assert_eq!(summary.tally, tally);
    }

    #[test]
    fn test_concurrent_appends() {
        let (_dir, rec) = recorder();
        let run = rec.begin(&snapshot()).unwrap();

        std::thread::scope(|s| {
            for t in 0..8 {
                let rec = rec.clone();
                s.spawn(move || {
                    for i in 0..25 {
                        let target = format!("t{t}-{i}.example");
                        rec.append(run, &result(&target, OutcomeKind::NxDomain)).unwrap();
                    }
                });
            }
        });

        assert_eq!(rec.count_results(run).unwrap(), 200);
    }

    #[test]
    fn test_reset_drops_previous_runs() {
        let (_dir, rec) = recorder();
        let run = rec.begin(&snapshot()).unwrap();
        rec.append(run, &result("a.example", OutcomeKind::Resolved)).unwrap();
        rec.begin(&snapshot()).unwrap();

        assert_eq!(rec.reset().unwrap(), 2);
        assert!(rec.list_runs().unwrap().is_empty());
        assert!(matches!(rec.run_summary(run), Err(StorageError::RunNotFound(_))));
    }

    #[test]
    fn test_list_runs_oldest_first() {
        let (_dir, rec) = recorder();
        let a = rec.begin(&snapshot()).unwrap();
        let b = rec.begin(&snapshot()).unwrap();
        let ids: Vec<RunId> = rec.list_runs().unwrap().iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![a, b]);
    }
}
