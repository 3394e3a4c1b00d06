use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, TxError};
use crate::ids::{RunId, TaskId};
use crate::model::{Event, Metadata, Run, RunStatus};
use crate::store::{
    Store, fmt_dt, metadata_to_string, now_rfc3339, parse_dt, parse_dt_opt, parse_metadata,
};

#[derive(Debug, Default, Clone)]
pub struct NewRun {
    pub task_id: Option<TaskId>,
    pub agent: String,
    pub pid: Option<u32>,
    pub transcript_path: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Default, Clone)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub agent: Option<String>,
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone)]
pub struct RunPage {
    pub runs: Vec<Run>,
    pub has_more: bool,
    pub total: i64,
    pub next: Option<(DateTime<Utc>, RunId)>,
}

#[derive(Debug, Default, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
}

impl Store {
    pub fn create_run(&self, new: NewRun) -> Result<Run> {
        self.transaction(|conn| {
            let id = RunId::generate().map_err(|e| TxError::Config(e.to_string()))?;
            conn.execute(
                "INSERT INTO runs (id, task_id, agent, pid, started_at, status,
                                   transcript_path, stdout_path, stderr_path, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7, ?8, ?9)",
                params![
                    id.as_str(),
                    new.task_id,
                    new.agent,
                    new.pid,
                    now_rfc3339(),
                    new.transcript_path,
                    new.stdout_path,
                    new.stderr_path,
                    metadata_to_string(&new.metadata),
                ],
            )?;
            require_run_tx(conn, id.as_str())
        })
    }

    pub fn get_run(&self, id: &str) -> Result<Run> {
        self.read(|conn| require_run_tx(conn, id))
    }

    pub fn mark_run_context_injected(&self, id: &str) -> Result<()> {
        self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE runs SET context_injected = 1 WHERE id = ?1",
                params![id],
            )?;
            if changes == 0 {
                return Err(TxError::RunNotFound(id.to_string()));
            }
            Ok(())
        })
    }

    pub fn finish_run(&self, id: &str, outcome: RunOutcome) -> Result<Run> {
        self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE runs SET status = ?2, ended_at = ?3, exit_code = ?4,
                                 summary = ?5, error_message = ?6
                 WHERE id = ?1",
                params![
                    id,
                    outcome.status.as_str(),
                    now_rfc3339(),
                    outcome.exit_code,
                    outcome.summary,
                    outcome.error_message,
                ],
            )?;
            if changes == 0 {
                return Err(TxError::RunNotFound(id.to_string()));
            }
            require_run_tx(conn, id)
        })
    }

    pub fn list_runs(
        &self,
        filter: &RunFilter,
        cursor: Option<(DateTime<Utc>, RunId)>,
        limit: usize,
    ) -> Result<RunPage> {
        self.read(|conn| {
            let mut conditions: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            let mut idx = 1;

            if let Some(status) = filter.status {
                conditions.push(format!("status = ?{idx}"));
                values.push(Box::new(status.as_str().to_string()));
                idx += 1;
            }
            if let Some(agent) = &filter.agent {
                conditions.push(format!("agent = ?{idx}"));
                values.push(Box::new(agent.clone()));
                idx += 1;
            }
            if let Some(task_id) = &filter.task_id {
                conditions.push(format!("task_id = ?{idx}"));
                values.push(Box::new(task_id.as_str().to_string()));
                idx += 1;
            }

            let base_where = if conditions.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", conditions.join(" AND "))
            };
            let total: i64 = {
                let sql = format!("SELECT COUNT(*) FROM runs{base_where}");
                let params_slice: Vec<&dyn rusqlite::types::ToSql> =
                    values.iter().map(|p| p.as_ref()).collect();
                conn.query_row(&sql, params_slice.as_slice(), |row| row.get(0))?
            };

            if let Some((started_at, run_id)) = &cursor {
                conditions.push(format!(
                    "(started_at < ?{idx} OR (started_at = ?{idx} AND id > ?{}))",
                    idx + 1
                ));
                values.push(Box::new(fmt_dt(*started_at)));
                values.push(Box::new(run_id.as_str().to_string()));
            }

            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", conditions.join(" AND "))
            };
            let sql = format!(
                "SELECT {RUN_COLUMNS} FROM runs{where_clause}
                 ORDER BY started_at DESC, id ASC LIMIT {}",
                limit + 1
            );
            let params_slice: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|p| p.as_ref()).collect();

            let mut stmt = conn.prepare_cached(&sql)?;
            let mut runs: Vec<Run> = stmt
                .query_map(params_slice.as_slice(), read_run)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let has_more = runs.len() > limit;
            runs.truncate(limit);
            let next = if has_more {
                runs.last().map(|r| (r.started_at, r.id.clone()))
            } else {
                None
            };

            Ok(RunPage {
                runs,
                has_more,
                total,
                next,
            })
        })
    }

    // -----------------------------------------------------------------------
    // Events (append-only observability feed)
    // -----------------------------------------------------------------------

    pub fn append_event(
        &self,
        event_type: &str,
        content: &str,
        duration_ms: Option<f64>,
        run_id: Option<&str>,
        metadata: Metadata,
    ) -> Result<Event> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO events (event_type, content, duration_ms, run_id, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event_type,
                    content,
                    duration_ms,
                    run_id,
                    metadata_to_string(&metadata),
                    now_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"))?;
            Ok(stmt.query_row(params![id], read_event)?)
        })
    }

    /// Most recent events first.
    pub fn list_events(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        self.read(|conn| {
            let sql = match limit {
                Some(n) => format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id DESC LIMIT {n}"),
                None => format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id DESC"),
            };
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([], read_event)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn events_for_run(&self, run_id: &str) -> Result<Vec<Event>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE run_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![run_id], read_event)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete events older than `max_age_secs`. Returns the number removed.
    pub fn prune_events(&self, max_age_secs: i64) -> Result<usize> {
        self.transaction(|conn| {
            let cutoff = fmt_dt(Utc::now() - chrono::Duration::seconds(max_age_secs));
            let count = conn.execute("DELETE FROM events WHERE created_at < ?1", params![cutoff])?;
            Ok(count)
        })
    }

    /// Keep only the most recent `max_events`. Returns the number removed.
    pub fn prune_events_by_count(&self, max_events: u32) -> Result<usize> {
        self.transaction(|conn| {
            let count = conn.execute(
                "DELETE FROM events WHERE id NOT IN (
                    SELECT id FROM events ORDER BY id DESC LIMIT ?1
                )",
                params![max_events],
            )?;
            Ok(count)
        })
    }
}

const RUN_COLUMNS: &str = "id, task_id, agent, pid, started_at, ended_at, status, exit_code, \
     transcript_path, stdout_path, stderr_path, context_injected, summary, error_message, metadata";

const EVENT_COLUMNS: &str = "id, event_type, content, duration_ms, run_id, metadata, created_at";

fn read_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let id: String = row.get(0)?;
    let status: String = row.get(6)?;
    let pid: Option<i64> = row.get(3)?;
    Ok(Run {
        id: id
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?,
        task_id: row.get(1)?,
        agent: row.get(2)?,
        pid: pid.map(|p| p as u32),
        started_at: parse_dt(&row.get::<_, String>(4)?),
        ended_at: parse_dt_opt(row.get(5)?),
        status: status.parse().unwrap_or_default(),
        exit_code: row.get(7)?,
        transcript_path: row.get(8)?,
        stdout_path: row.get(9)?,
        stderr_path: row.get(10)?,
        context_injected: row.get(11)?,
        summary: row.get(12)?,
        error_message: row.get(13)?,
        metadata: parse_metadata(&row.get::<_, String>(14)?),
    })
}

fn read_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        event_type: row.get(1)?,
        content: row.get(2)?,
        duration_ms: row.get(3)?,
        run_id: row.get(4)?,
        metadata: parse_metadata(&row.get::<_, String>(5)?),
        created_at: parse_dt(&row.get::<_, String>(6)?),
    })
}

fn require_run_tx(conn: &Connection, id: &str) -> Result<Run> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
    stmt.query_row(params![id], read_run)
        .optional()?
        .ok_or_else(|| TxError::RunNotFound(id.to_string()))
}
