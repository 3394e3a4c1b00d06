use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, TxError};
use crate::model::Metadata;

pub mod anchors;
pub mod docs;
pub mod learnings;
pub mod migrations;
pub mod runs;
pub mod tasks;
pub mod workers;

/// Callback invoked after task/dependency/learning mutations commit; the
/// auto-sync hook uses it to schedule a debounced JSONL export.
pub type MutationHook = std::sync::Arc<dyn Fn() + Send + Sync>;

/// The single source of truth: one SQLite connection per process, guarded by
/// a mutex so concurrent callers serialize on transactions and statements.
pub struct Store {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    after_mutation: Mutex<Option<MutationHook>>,
}

impl Store {
    /// Open (or create) the database, enable WAL + foreign keys, and apply
    /// any pending migrations. Migration failure aborts the open.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get(0)
        })?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(%mode, "WAL unavailable; continuing with fallback journal mode");
        }
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;

        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
            after_mutation: Mutex::new(None),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
            after_mutation: Mutex::new(None),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Install the after-mutation callback. Task, dependency, and learning
    /// mutations fire it once their transaction has committed.
    pub fn set_after_mutation(&self, hook: Option<MutationHook>) {
        let mut slot = self
            .after_mutation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = hook;
    }

    pub(crate) fn notify_mutation(&self) {
        let hook = {
            let slot = self
                .after_mutation
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a read-only closure against the shared connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction: errors roll back, success commits
    /// once at the outermost boundary. Helpers invoked by `f` take the same
    /// `&Connection`, so nested work reuses this transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Versions recorded in `schema_version`, ascending.
    pub fn applied_migrations(&self) -> Result<Vec<i64>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT version FROM schema_version ORDER BY version")?;
            let versions = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(versions)
        })
    }

    /// Read a value from the `config` table.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| config_get_tx(conn, key))
    }

    /// Write a value to the `config` table.
    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
    }
}

pub(crate) fn config_get_tx(conn: &Connection, key: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    let value = conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let has_table: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    let current: i64 = if has_table > 0 {
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })?
    } else {
        0
    };

    for migration in migrations::MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| migration_error(migration.version, e))?;
        tx.execute_batch(migration.sql)
            .map_err(|e| migration_error(migration.version, e))?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, now_rfc3339()],
        )
        .map_err(|e| migration_error(migration.version, e))?;
        tx.commit().map_err(|e| migration_error(migration.version, e))?;
        tracing::debug!(version = migration.version, name = migration.name, "applied migration");
    }
    Ok(())
}

fn migration_error(version: i64, err: rusqlite::Error) -> TxError {
    TxError::Migration {
        version,
        message: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers: fixed-width RFC 3339 UTC so TEXT comparisons sort
// ---------------------------------------------------------------------------

pub(crate) fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_rfc3339() -> String {
    fmt_dt(Utc::now())
}

pub(crate) fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_dt(&v))
}

// ---------------------------------------------------------------------------
// Metadata (JSON object) column helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_metadata(raw: &str) -> Metadata {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn metadata_to_string(metadata: &Metadata) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn parse_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn string_list_to_string(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}
