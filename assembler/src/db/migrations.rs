//! Build history schema, applied in order and tracked with
//! `PRAGMA user_version`.

use super::db_err;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use rusqlite::Connection;

const MIGRATIONS: &[&str] = &[
    // 1: builds table
    "
    CREATE TABLE builds (
        id TEXT PRIMARY KEY NOT NULL,
        created_at TEXT NOT NULL,
        mode TEXT NOT NULL,
        lock_digest TEXT,
        package_digest TEXT NOT NULL,
        image_digest TEXT NOT NULL,
        reproducible INTEGER NOT NULL,
        record TEXT NOT NULL
    );
    CREATE INDEX idx_builds_created_at ON builds(created_at);
    ",
    // 2: reproducibility lookups
    "
    CREATE INDEX idx_builds_lock_digest ON builds(lock_digest, package_digest);
    ",
];

pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring `conn` up to `SCHEMA_VERSION`. Returns the version found on disk.
pub(super) fn migrate(conn: &mut Connection) -> AssemblerResult<u32> {
    let found: u32 = db_err!(conn.pragma_query_value(None, "user_version", |row| row.get(0)))?;
    if found > SCHEMA_VERSION {
        return Err(AssemblerError::Database(format!(
            "build history schema version {} is newer than supported {}",
            found, SCHEMA_VERSION
        )));
    }
    if found == SCHEMA_VERSION {
        return Ok(found);
    }

    let tx = db_err!(conn.transaction())?;
    for (i, sql) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        db_err!(tx.execute_batch(sql))?;
        tracing::debug!(version = i + 1, "Applied build history migration");
    }
    db_err!(tx.pragma_update(None, "user_version", SCHEMA_VERSION))?;
    db_err!(tx.commit())?;

    tracing::info!(from = found, to = SCHEMA_VERSION, "Migrated build history");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_then_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), 0);
        assert_eq!(migrate(&mut conn).unwrap(), SCHEMA_VERSION);

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_from_first_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();

        assert_eq!(migrate(&mut conn).unwrap(), 1);
        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_builds_lock_digest'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(migrate(&mut conn), Err(AssemblerError::Database(_))));
    }
}
