//! Database schema and migrations.

use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'in-progress'
                CHECK (status IN ('in-progress', 'completed', 'failed')),
            config_json TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            targets_probed INTEGER NOT NULL DEFAULT 0,
            targets_skipped INTEGER NOT NULL DEFAULT 0,
            targets_excluded INTEGER NOT NULL DEFAULT 0,
            results_written INTEGER NOT NULL DEFAULT 0,
            results_failed INTEGER NOT NULL DEFAULT 0,
            resolved INTEGER NOT NULL DEFAULT 0,
            nxdomain INTEGER NOT NULL DEFAULT 0,
            timeout INTEGER NOT NULL DEFAULT 0,
            server_error INTEGER NOT NULL DEFAULT 0,
            malformed_response INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS probe_results (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL,
            target TEXT NOT NULL,
            server TEXT NOT NULL,
            outcome TEXT NOT NULL,
            rtt_us INTEGER NOT NULL,
            error TEXT,
            raw_response BLOB,
            created_at TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS resolved_addresses (
            id INTEGER PRIMARY KEY,
            result_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            enriched INTEGER NOT NULL DEFAULT 0,
            country_code TEXT,
            asn INTEGER,
            as_name TEXT,
            FOREIGN KEY (result_id) REFERENCES probe_results(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_probe_results_run ON probe_results(run_id);
        CREATE INDEX IF NOT EXISTS idx_probe_results_target ON probe_results(run_id, target);
        CREATE INDEX IF NOT EXISTS idx_resolved_addresses_result ON resolved_addresses(result_id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Drop every table and recreate the schema. Destroys all run history.
pub fn reset(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS resolved_addresses;
         DROP TABLE IF EXISTS probe_results;
         DROP TABLE IF EXISTS runs;
         DROP TABLE IF EXISTS schema_version;",
    )?;
    migrate(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["runs", "probe_results", "resolved_addresses"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table}");
        }

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_status_is_constrained() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let bad = conn.execute(
            "INSERT INTO runs (tag, status, config_json, started_at) VALUES ('t', 'done', '{}', 'now')",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_reset_clears_history() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO runs (tag, config_json, started_at) VALUES ('t', '{}', 'now')",
            [],
        )
        .unwrap();

        reset(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
