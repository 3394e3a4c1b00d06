use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TxError};
use crate::ids::{TaskId, line_hash};
use crate::model::{Dependency, Task};
use crate::store::tasks::{
    all_dependencies_tx, all_tasks_tx, delete_dependency_tx, delete_task_tx, get_task_tx,
    upsert_dependency_tx, upsert_task_tx,
};
use crate::store::{Store, fmt_dt};

pub mod autosync;

pub const OP_UPSERT_TASK: &str = "upsert_task";
pub const OP_DELETE_TASK: &str = "delete_task";
pub const OP_UPSERT_DEP: &str = "upsert_dep";
pub const OP_DELETE_DEP: &str = "delete_dep";

const STATE_LAST_EXPORT: &str = "last_export";
const STATE_LAST_IMPORT: &str = "last_import";
const STATE_JSONL_HASH: &str = "jsonl_hash";

/// One JSONL operation: `{op, ts, data}`, one per line, `\n` terminated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOp {
    pub op: String,
    pub ts: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub tasks: usize,
    pub deps: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub db_task_count: i64,
    pub jsonl_op_count: usize,
    pub last_export: Option<DateTime<Utc>>,
    pub last_import: Option<DateTime<Utc>>,
    pub is_dirty: bool,
    pub auto_sync_enabled: bool,
}

/// Key identifying the entity an op applies to; last-writer-wins merges and
/// compaction both group by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OpKey {
    Task(TaskId),
    Dep(TaskId, TaskId),
}

/// The JSONL operation log: the portable, git-diffable interchange format
/// for tasks and dependencies.
pub struct JsonlSync {
    store: Arc<Store>,
    path: PathBuf,
    auto_sync_enabled: bool,
}

impl JsonlSync {
    pub fn new(store: Arc<Store>, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            path: path.into(),
            auto_sync_enabled: false,
        }
    }

    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync_enabled = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Snapshot all live tasks and deps in one transaction and atomically
    /// rewrite the log: tasks ordered by id, deps by (blocker, blocked).
    /// Tombstones are never exported.
    pub fn export(&self) -> Result<ExportReport> {
        let (tasks, deps) = self.store.transaction(|conn| {
            Ok((all_tasks_tx(conn)?, all_dependencies_tx(conn)?))
        })?;

        let mut buf = String::new();
        for task in &tasks {
            let op = SyncOp {
                op: OP_UPSERT_TASK.to_string(),
                ts: fmt_dt(task.updated_at),
                data: serde_json::to_value(task)?,
            };
            buf.push_str(&serde_json::to_string(&op)?);
            buf.push('\n');
        }
        for dep in &deps {
            let op = SyncOp {
                op: OP_UPSERT_DEP.to_string(),
                ts: fmt_dt(dep.created_at),
                data: dep_data(dep),
            };
            buf.push_str(&serde_json::to_string(&op)?);
            buf.push('\n');
        }

        write_atomic(&self.path, buf.as_bytes())?;
        self.store
            .config_sync_state(STATE_LAST_EXPORT, &fmt_dt(Utc::now()))?;
        self.store
            .config_sync_state(STATE_JSONL_HASH, &line_hash(buf.as_bytes()))?;

        tracing::debug!(tasks = tasks.len(), deps = deps.len(), "exported jsonl");
        Ok(ExportReport {
            tasks: tasks.len(),
            deps: deps.len(),
        })
    }

    /// Merge the log into the store with per-line last-writer-wins. Lines are
    /// deduplicated by their exact byte hash; within one import the first
    /// applied op per entity key wins and later ones are skipped.
    pub fn import(&self) -> Result<ImportReport> {
        let raw = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ImportReport::default());
            }
            Err(e) => return Err(e.into()),
        };
        let content = String::from_utf8_lossy(&raw).into_owned();

        let mut report = ImportReport::default();
        let mut seen_lines: HashSet<String> = HashSet::new();
        let mut applied_keys: HashSet<OpKey> = HashSet::new();

        self.store.transaction(|conn| {
            conn.execute_batch("PRAGMA defer_foreign_keys = ON;")?;

            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if !seen_lines.insert(line_hash(line.as_bytes())) {
                    report.skipped += 1;
                    continue;
                }

                let Some((op, ts, key)) = parse_line(line) else {
                    report.skipped += 1;
                    continue;
                };
                if applied_keys.contains(&key) {
                    report.skipped += 1;
                    continue;
                }

                match apply_op(conn, &op, ts, &key)? {
                    Applied::Imported => {
                        report.imported += 1;
                        applied_keys.insert(key);
                    }
                    Applied::Skipped => report.skipped += 1,
                    Applied::Conflict => report.conflicts += 1,
                }
            }
            Ok(())
        })?;

        self.store
            .config_sync_state(STATE_LAST_IMPORT, &fmt_dt(Utc::now()))?;
        self.store
            .config_sync_state(STATE_JSONL_HASH, &line_hash(content.as_bytes()))?;

        tracing::debug!(?report, "imported jsonl");
        Ok(report)
    }

    /// Keep only the newest op per entity key, dropping keys whose final
    /// state is deleted, and atomically replace the log. Idempotent.
    pub fn compact(&self) -> Result<CompactReport> {
        let raw = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CompactReport::default());
            }
            Err(e) => return Err(e.into()),
        };
        let content = String::from_utf8_lossy(&raw).into_owned();

        let mut before = 0;
        // Latest op per key; later equal timestamps replace earlier lines so
        // file order breaks ties.
        let mut latest: HashMap<OpKey, (DateTime<Utc>, SyncOp)> = HashMap::new();
        let mut order: Vec<OpKey> = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            before += 1;
            let Some((op, ts, key)) = parse_line(line) else {
                continue;
            };
            match latest.get(&key) {
                Some((existing_ts, _)) if *existing_ts > ts => {}
                Some(_) => {
                    latest.insert(key, (ts, op));
                }
                None => {
                    latest.insert(key.clone(), (ts, op));
                    order.push(key);
                }
            }
        }

        let mut buf = String::new();
        let mut after = 0;
        for key in &order {
            let Some((_, op)) = latest.get(key) else {
                continue;
            };
            if op.op == OP_DELETE_TASK || op.op == OP_DELETE_DEP {
                continue;
            }
            buf.push_str(&serde_json::to_string(op)?);
            buf.push('\n');
            after += 1;
        }

        write_atomic(&self.path, buf.as_bytes())?;
        self.store
            .config_sync_state(STATE_JSONL_HASH, &line_hash(buf.as_bytes()))?;
        Ok(CompactReport { before, after })
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let db_task_count = self.store.task_count()?;
        let last_export = self
            .store
            .config_get_sync(STATE_LAST_EXPORT)?
            .map(|s| crate::store::parse_dt(&s));
        let last_import = self
            .store
            .config_get_sync(STATE_LAST_IMPORT)?
            .map(|s| crate::store::parse_dt(&s));
        let known_hash = self.store.config_get_sync(STATE_JSONL_HASH)?;

        let (jsonl_op_count, current_hash, mtime) = match fs::read(&self.path) {
            Ok(bytes) => {
                let count = String::from_utf8_lossy(&bytes)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .count();
                let mtime = fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from);
                (count, Some(line_hash(&bytes)), mtime)
            }
            Err(_) => (0, None, None),
        };

        // A never-imported log is caught by the hash comparison; mtime only
        // says something once an import has happened.
        let mtime_newer = match (mtime, last_import) {
            (Some(mtime), Some(import)) => mtime > import,
            _ => false,
        };
        let hash_differs = current_hash != known_hash;
        let is_dirty = mtime_newer || hash_differs;

        Ok(SyncStatus {
            db_task_count,
            jsonl_op_count,
            last_export,
            last_import,
            is_dirty,
            auto_sync_enabled: self.auto_sync_enabled,
        })
    }
}

impl Store {
    fn config_sync_state(&self, key: &str, value: &str) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
    }

    fn config_get_sync(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| {
            use rusqlite::OptionalExtension;
            let value = conn
                .query_row(
                    "SELECT value FROM sync_state WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }
}

enum Applied {
    Imported,
    Skipped,
    Conflict,
}

fn dep_data(dep: &Dependency) -> serde_json::Value {
    serde_json::json!({
        "id": format!("{}:{}", dep.blocker_id, dep.blocked_id),
        "blocker_id": dep.blocker_id,
        "blocked_id": dep.blocked_id,
        "created_at": fmt_dt(dep.created_at),
    })
}

/// Parse and validate one line. Returns None for malformed lines and for
/// unknown op types (both are counted as skipped by the caller).
fn parse_line(line: &str) -> Option<(SyncOp, DateTime<Utc>, OpKey)> {
    let op: SyncOp = serde_json::from_str(line).ok()?;
    let ts = DateTime::parse_from_rfc3339(&op.ts)
        .ok()?
        .with_timezone(&Utc);
    let data = op.data.as_object()?;
    data.get("id")?.as_str()?;

    let key = match op.op.as_str() {
        OP_UPSERT_TASK | OP_DELETE_TASK => {
            let id: TaskId = data.get("id")?.as_str()?.parse().ok()?;
            OpKey::Task(id)
        }
        OP_UPSERT_DEP | OP_DELETE_DEP => {
            let blocker: TaskId = data.get("blocker_id")?.as_str()?.parse().ok()?;
            let blocked: TaskId = data.get("blocked_id")?.as_str()?.parse().ok()?;
            OpKey::Dep(blocker, blocked)
        }
        _ => return None,
    };
    Some((op, ts, key))
}

fn apply_op(
    conn: &rusqlite::Connection,
    op: &SyncOp,
    ts: DateTime<Utc>,
    key: &OpKey,
) -> Result<Applied> {
    match (op.op.as_str(), key) {
        (OP_UPSERT_TASK, OpKey::Task(id)) => {
            let Ok(incoming) = serde_json::from_value::<Task>(op.data.clone()) else {
                return Ok(Applied::Skipped);
            };
            match get_task_tx(conn, id)? {
                Some(local) if ts <= local.updated_at => Ok(Applied::Conflict),
                _ => {
                    upsert_task_tx(conn, &incoming)?;
                    Ok(Applied::Imported)
                }
            }
        }
        (OP_DELETE_TASK, OpKey::Task(id)) => match get_task_tx(conn, id)? {
            None => Ok(Applied::Skipped),
            Some(local) if ts <= local.updated_at => Ok(Applied::Conflict),
            Some(_) => {
                // Orphan children rather than dangling their parent pointer.
                conn.execute(
                    "UPDATE tasks SET parent_id = NULL WHERE parent_id = ?1",
                    rusqlite::params![id],
                )?;
                delete_task_tx(conn, id)?;
                Ok(Applied::Imported)
            }
        },
        (OP_UPSERT_DEP, OpKey::Dep(blocker, blocked)) => {
            let created_at = op
                .data
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(ts);
            let existing: Option<String> = {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT created_at FROM dependencies
                     WHERE blocker_id = ?1 AND blocked_id = ?2",
                    rusqlite::params![blocker, blocked],
                    |row| row.get(0),
                )
                .optional()?
            };
            match existing {
                Some(local) if ts <= crate::store::parse_dt(&local) => Ok(Applied::Conflict),
                _ => {
                    upsert_dependency_tx(
                        conn,
                        &Dependency {
                            blocker_id: blocker.clone(),
                            blocked_id: blocked.clone(),
                            created_at,
                        },
                    )?;
                    Ok(Applied::Imported)
                }
            }
        }
        (OP_DELETE_DEP, OpKey::Dep(blocker, blocked)) => {
            if delete_dependency_tx(conn, blocker, blocked)? {
                Ok(Applied::Imported)
            } else {
                Ok(Applied::Skipped)
            }
        }
        _ => Ok(Applied::Skipped),
    }
}

/// Write-temp-then-rename under an advisory lock, with one retry on
/// transient rename failure. The parent directory is fsync'd where the
/// platform permits.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| TxError::Locked(lock_path.display().to_string()))?;

    let tmp_path = path.with_extension("jsonl.tmp");
    let result = (|| -> Result<()> {
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(bytes)?;
            tmp.sync_all()?;
        }
        if let Err(first) = fs::rename(&tmp_path, path) {
            if first.kind() == std::io::ErrorKind::Interrupted
                || first.kind() == std::io::ErrorKind::WouldBlock
            {
                fs::rename(&tmp_path, path)?;
            } else {
                return Err(first.into());
            }
        }
        if let Some(parent) = parent
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    })();

    let _ = fs2::FileExt::unlock(&lock_file);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
