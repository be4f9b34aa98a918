//! Schema migrations.
//!
//! Applied versions are recorded in `_migrations`; every missing version runs
//! in its own transaction, in order.

use std::collections::HashSet;

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    Standard,
    /// Skipped when the column is already there.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_catalog_tables",
        sql: include_str!("sql/001_create_catalog.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_flow_configuration_tables",
        sql: include_str!("sql/002_create_flow_configurations.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_job_tables",
        sql: include_str!("sql/003_create_jobs.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_delay_and_lead_time_tables",
        sql: include_str!("sql/004_create_delay_and_lead_time.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "seed_catalog_and_system_flows",
        sql: include_str!("sql/005_seed_catalog.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 6,
        description: "add_blocked_reason_to_progress_assignments",
        sql: include_str!("sql/006_add_blocked_reason.sql"),
        kind: MigrationKind::AddColumn {
            table: "progress_assignments",
            column: "blocked_reason",
        },
    },
];

impl Migration {
    /// Whether the SQL still has to run. Conditional kinds look at the live
    /// schema so a column added by hand is not added twice.
    fn needed(&self, conn: &Connection) -> Result<bool, DatabaseError> {
        match self.kind {
            MigrationKind::Standard => Ok(true),
            MigrationKind::AddColumn { table, column } => {
                Ok(!column_exists(conn, table, column)?)
            }
        }
    }

    fn apply(&self, conn: &mut Connection) -> Result<(), DatabaseError> {
        let tx = conn.transaction()?;
        if self.needed(&tx)? {
            tx.execute_batch(self.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: self.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::debug!("Migration v{} already reflected in schema", self.version);
        }
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![self.version, self.description],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Brings the schema up to the latest version.
///
/// Returns how many migrations were applied.
pub fn run_all(conn: &mut Connection) -> Result<usize, DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    )?;

    let applied: HashSet<u32> = {
        let mut stmt = conn.prepare("SELECT version FROM _migrations")?;
        let versions = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        versions
    };

    let mut count = 0;
    for migration in MIGRATIONS.iter().filter(|m| !applied.contains(&m.version)) {
        log::info!("Applying migration v{} ({})", migration.version, migration.description);
        migration.apply(conn)?;
        count += 1;
    }
    Ok(count)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let found: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |r| r.get(0),
    )?;
    Ok(found > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = fresh();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = fresh();
        assert_eq!(run_all(&mut conn).unwrap(), 0);

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);

        // The seed must not have been applied twice.
        let systems: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM flow_configurations WHERE is_system = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(systems, 3);
    }

    #[test]
    fn test_add_column_is_skipped_when_present() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE _migrations (version INTEGER PRIMARY KEY, description TEXT NOT NULL,
                 applied_at TEXT NOT NULL DEFAULT '');",
        )
        .unwrap();
        for migration in &MIGRATIONS[..5] {
            migration.apply(&mut conn).unwrap();
        }
        conn.execute_batch("ALTER TABLE progress_assignments ADD COLUMN blocked_reason TEXT;")
            .unwrap();

        assert_eq!(run_all(&mut conn).unwrap(), 1);
        assert!(column_exists(&conn, "progress_assignments", "blocked_reason").unwrap());
        assert!(!column_exists(&conn, "progress_assignments", "missing").unwrap());
    }

    #[test]
    fn test_progress_assignments_has_blocked_reason() {
        let conn = fresh();
        assert!(column_exists(&conn, "progress_assignments", "blocked_reason").unwrap());
    }

    #[test]
    fn test_seeded_system_flows_have_unique_orders() {
        let conn = fresh();
        let duplicates: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM (
                    SELECT flow_configuration_id, step_order FROM flow_steps
                    GROUP BY flow_configuration_id, step_order HAVING COUNT(*) > 1
                 )",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(duplicates, 0);

        let steps: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM flow_steps fs
                 JOIN flow_configurations f ON f.id = fs.flow_configuration_id
                 WHERE f.sample_type = 'new_product'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(steps, 5);
    }
}
