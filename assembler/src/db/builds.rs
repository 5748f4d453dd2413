//! Completed build records.

use super::{db_err, migrations};
use crate::planner::BuildMode;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// ULID
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub mode: BuildMode,
    /// Digest of the lockfile bytes, absent for manifest-only builds.
    pub lock_digest: Option<String>,
    pub package_digest: String,
    pub image_digest: String,
    pub reproducible: bool,
    pub packages: BTreeMap<String, String>,
    pub output: PathBuf,
}

/// History of completed builds.
#[derive(Clone)]
pub struct BuildStore {
    conn: Arc<Mutex<Connection>>,
}

impl BuildStore {
    /// Open or create the history at `path` and migrate it.
    pub fn open(path: &Path) -> AssemblerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = db_err!(Connection::open(path))?;
        // Writers from concurrent builds wait up to 30s for the lock.
        db_err!(conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=30000;"
        ))?;
        migrations::migrate(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn save(&self, record: &BuildRecord) -> AssemblerResult<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| AssemblerError::Database(format!("serialize build record: {}", e)))?;
        let conn = self.conn.lock();
        db_err!(conn.execute(
            "INSERT INTO builds (id, created_at, mode, lock_digest, package_digest, image_digest, reproducible, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.id,
                record.created_at.to_rfc3339(),
                record.mode.to_string(),
                record.lock_digest,
                record.package_digest,
                record.image_digest,
                record.reproducible,
                json,
            ],
        ))?;
        tracing::debug!(build_id = %record.id, "Saved build record");
        Ok(())
    }

    pub fn get(&self, id: &str) -> AssemblerResult<Option<BuildRecord>> {
        let conn = self.conn.lock();
        let json: Option<String> = db_err!(
            conn.query_row("SELECT record FROM builds WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
        )?;
        json.map(|j| decode(&j)).transpose()
    }

    /// Most recent builds first.
    pub fn list(&self, limit: usize) -> AssemblerResult<Vec<BuildRecord>> {
        self.query(
            "SELECT record FROM builds ORDER BY created_at DESC, id DESC LIMIT ?1",
            rusqlite::params![limit as i64],
        )
    }

    /// Earlier builds from the same lockfile, most recent first.
    pub fn find_by_lock_digest(&self, lock_digest: &str) -> AssemblerResult<Vec<BuildRecord>> {
        self.query(
            "SELECT record FROM builds WHERE lock_digest = ?1 ORDER BY created_at DESC, id DESC",
            rusqlite::params![lock_digest],
        )
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> AssemblerResult<Vec<BuildRecord>> {
        let conn = self.conn.lock();
        let mut stmt = db_err!(conn.prepare(sql))?;
        let rows = db_err!(stmt.query_map(params, |row| row.get::<_, String>(0)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(&db_err!(row)?)?);
        }
        Ok(out)
    }
}

fn decode(json: &str) -> AssemblerResult<BuildRecord> {
    serde_json::from_str(json)
        .map_err(|e| AssemblerError::Database(format!("corrupt build record: {}", e)))
}
