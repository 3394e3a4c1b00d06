use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Result, TxError};
use crate::ids::{TaskId, WorkerId};
use crate::model::{ClaimStatus, TaskClaim, Worker, WorkerStatus};
use crate::store::{
    Store, fmt_dt, now_rfc3339, parse_dt, parse_string_list, string_list_to_string,
};

pub const DEFAULT_LEASE_MINUTES: i64 = 30;
pub const MAX_LEASE_MINUTES: i64 = 240;
/// Renewal cap is service policy, not schema; see `renew_claim`.
pub const MAX_RENEWALS: i64 = 10;
/// Workers silent for this long are reconciled to `dead`.
pub const DEAD_WORKER_AFTER_SECS: i64 = 300;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub expired_claims: usize,
    pub dead_workers: usize,
}

impl Store {
    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    pub fn register_worker(
        &self,
        name: &str,
        hostname: &str,
        pid: u32,
        capabilities: &[String],
    ) -> Result<Worker> {
        self.transaction(|conn| {
            let id = WorkerId::generate().map_err(|e| TxError::Config(e.to_string()))?;
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO workers (id, name, hostname, pid, capabilities, status,
                                      registered_at, last_heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'starting', ?6, ?6)",
                params![
                    id.as_str(),
                    name,
                    hostname,
                    pid,
                    string_list_to_string(capabilities),
                    now,
                ],
            )?;
            require_worker_tx(conn, id.as_str())
        })
    }

    pub fn get_worker(&self, id: &str) -> Result<Worker> {
        self.read(|conn| require_worker_tx(conn, id))
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id"))?;
            let rows = stmt
                .query_map([], read_worker)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Stamp the heartbeat; the first beat flips `starting` to `idle`.
    pub fn worker_heartbeat(&self, id: &str) -> Result<Worker> {
        self.transaction(|conn| {
            let worker = require_worker_tx(conn, id)?;
            let status = if worker.status == WorkerStatus::Starting {
                WorkerStatus::Idle
            } else {
                worker.status
            };
            conn.execute(
                "UPDATE workers SET last_heartbeat_at = ?2, status = ?3 WHERE id = ?1",
                params![id, now_rfc3339(), status.as_str()],
            )?;
            require_worker_tx(conn, id)
        })
    }

    /// `idle -> busy`, recording the accepted task.
    pub fn worker_accept_task(&self, id: &str, task_id: &TaskId) -> Result<Worker> {
        self.transaction(|conn| {
            let worker = require_worker_tx(conn, id)?;
            if worker.status != WorkerStatus::Idle {
                return Err(TxError::InvalidTransition(
                    worker.status.to_string(),
                    WorkerStatus::Busy.to_string(),
                ));
            }
            conn.execute(
                "UPDATE workers SET status = 'busy', current_task_id = ?2 WHERE id = ?1",
                params![id, task_id],
            )?;
            require_worker_tx(conn, id)
        })
    }

    /// `busy -> idle`, clearing the current task.
    pub fn worker_complete_task(&self, id: &str) -> Result<Worker> {
        self.transaction(|conn| {
            require_worker_tx(conn, id)?;
            conn.execute(
                "UPDATE workers SET status = 'idle', current_task_id = NULL WHERE id = ?1",
                params![id],
            )?;
            require_worker_tx(conn, id)
        })
    }

    /// Graceful shutdown: `stopping`, then `dead`.
    pub fn worker_set_status(&self, id: &str, status: WorkerStatus) -> Result<Worker> {
        self.transaction(|conn| {
            let changes = conn.execute(
                "UPDATE workers SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            if changes == 0 {
                return Err(TxError::WorkerNotFound(id.to_string()));
            }
            require_worker_tx(conn, id)
        })
    }

    // -----------------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------------

    /// Take an exclusive lease on a task. Performs, in one transaction:
    /// 1. look up the active claim
    /// 2. unexpired and held by someone else -> `ClaimConflict`
    /// 3. expired -> mark expired and continue
    /// 4. insert the new active claim
    pub fn claim_task(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        lease_minutes: Option<i64>,
    ) -> Result<TaskClaim> {
        let lease = lease_minutes
            .unwrap_or(DEFAULT_LEASE_MINUTES)
            .clamp(1, MAX_LEASE_MINUTES);

        self.transaction(|conn| {
            crate::store::tasks::require_task_tx(conn, task_id)?;
            let now = Utc::now();

            if let Some(existing) = active_claim_tx(conn, task_id)? {
                if existing.lease_expires_at > now {
                    if existing.worker_id.as_str() != worker_id {
                        return Err(TxError::ClaimConflict {
                            task: task_id.clone(),
                            holder: existing.worker_id.as_str().to_string(),
                            expires_at: fmt_dt(existing.lease_expires_at),
                        });
                    }
                    // Re-claim by the holder refreshes the lease.
                    conn.execute(
                        "UPDATE task_claims SET status = 'released' WHERE id = ?1",
                        params![existing.id],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE task_claims SET status = 'expired' WHERE id = ?1",
                        params![existing.id],
                    )?;
                }
            }

            let expires = now + Duration::minutes(lease);
            conn.execute(
                "INSERT INTO task_claims (task_id, worker_id, claimed_at, lease_minutes,
                                          lease_expires_at, renewed_count, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 'active')",
                params![task_id, worker_id, fmt_dt(now), lease, fmt_dt(expires)],
            )?;
            let id = conn.last_insert_rowid();
            require_claim_tx(conn, id)
        })
    }

    /// Extend the active claim by its original lease length. Enforces the
    /// renewal cap here rather than in the schema.
    pub fn renew_claim(&self, task_id: &TaskId, worker_id: &str) -> Result<TaskClaim> {
        self.transaction(|conn| {
            let Some(claim) = active_claim_tx(conn, task_id)? else {
                return Err(TxError::ClaimNotHeld(task_id.clone(), worker_id.to_string()));
            };
            if claim.worker_id.as_str() != worker_id {
                return Err(TxError::ClaimNotHeld(task_id.clone(), worker_id.to_string()));
            }
            if claim.renewed_count >= MAX_RENEWALS {
                return Err(TxError::RenewalCapExceeded(task_id.clone()));
            }

            let lease_minutes: i64 = conn.query_row(
                "SELECT lease_minutes FROM task_claims WHERE id = ?1",
                params![claim.id],
                |row| row.get(0),
            )?;
            let new_expiry = claim.lease_expires_at + Duration::minutes(lease_minutes);
            conn.execute(
                "UPDATE task_claims SET lease_expires_at = ?2, renewed_count = renewed_count + 1
                 WHERE id = ?1",
                params![claim.id, fmt_dt(new_expiry)],
            )?;
            require_claim_tx(conn, claim.id)
        })
    }

    /// Release the worker's active claim. Succeeds even when nothing is held.
    pub fn release_claim(&self, task_id: &TaskId, worker_id: &str) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "UPDATE task_claims SET status = 'released'
                 WHERE task_id = ?1 AND worker_id = ?2 AND status = 'active'",
                params![task_id, worker_id],
            )?;
            Ok(())
        })
    }

    pub fn active_claim(&self, task_id: &TaskId) -> Result<Option<TaskClaim>> {
        self.read(|conn| active_claim_tx(conn, task_id))
    }

    pub fn claims_for_worker(&self, worker_id: &str) -> Result<Vec<TaskClaim>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {CLAIM_COLUMNS} FROM task_claims WHERE worker_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![worker_id], read_claim)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Expire lapsed claims and mark silent workers dead (expiring their
    /// claims as well). Run on a timer and from doctor/heartbeat routines.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.transaction(|conn| {
            let now = Utc::now();
            let now_str = fmt_dt(now);

            let expired_claims = conn.execute(
                "UPDATE task_claims SET status = 'expired'
                 WHERE status = 'active' AND lease_expires_at < ?1",
                params![now_str],
            )?;

            let heartbeat_cutoff = fmt_dt(now - Duration::seconds(DEAD_WORKER_AFTER_SECS));
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM workers
                 WHERE status NOT IN ('dead', 'stopping') AND last_heartbeat_at < ?1",
            )?;
            let stale: Vec<String> = stmt
                .query_map(params![heartbeat_cutoff], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut extra_expired = 0;
            for worker_id in &stale {
                conn.execute(
                    "UPDATE workers SET status = 'dead', current_task_id = NULL WHERE id = ?1",
                    params![worker_id],
                )?;
                extra_expired += conn.execute(
                    "UPDATE task_claims SET status = 'expired'
                     WHERE worker_id = ?1 AND status = 'active'",
                    params![worker_id],
                )?;
            }

            if !stale.is_empty() {
                tracing::warn!(count = stale.len(), "reconciled dead workers");
            }

            Ok(ReconcileReport {
                expired_claims: expired_claims + extra_expired,
                dead_workers: stale.len(),
            })
        })
    }
}

const WORKER_COLUMNS: &str =
    "id, name, hostname, pid, capabilities, status, current_task_id, registered_at, last_heartbeat_at";

const CLAIM_COLUMNS: &str =
    "id, task_id, worker_id, claimed_at, lease_expires_at, renewed_count, status";

fn read_worker(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let id: String = row.get(0)?;
    let status: String = row.get(5)?;
    let pid: i64 = row.get(3)?;
    Ok(Worker {
        id: id
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?,
        name: row.get(1)?,
        hostname: row.get(2)?,
        pid: pid as u32,
        capabilities: parse_string_list(&row.get::<_, String>(4)?),
        status: status.parse().unwrap_or_default(),
        current_task_id: row.get(6)?,
        registered_at: parse_dt(&row.get::<_, String>(7)?),
        last_heartbeat_at: parse_dt(&row.get::<_, String>(8)?),
    })
}

fn read_claim(row: &Row<'_>) -> rusqlite::Result<TaskClaim> {
    let worker_id: String = row.get(2)?;
    let status: String = row.get(6)?;
    Ok(TaskClaim {
        id: row.get(0)?,
        task_id: row.get(1)?,
        worker_id: worker_id
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?,
        claimed_at: parse_dt(&row.get::<_, String>(3)?),
        lease_expires_at: parse_dt(&row.get::<_, String>(4)?),
        renewed_count: row.get(5)?,
        status: status.parse::<ClaimStatus>().unwrap_or_default(),
    })
}

fn require_worker_tx(conn: &Connection, id: &str) -> Result<Worker> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"))?;
    stmt.query_row(params![id], read_worker)
        .optional()?
        .ok_or_else(|| TxError::WorkerNotFound(id.to_string()))
}

fn require_claim_tx(conn: &Connection, id: i64) -> Result<TaskClaim> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {CLAIM_COLUMNS} FROM task_claims WHERE id = ?1"))?;
    Ok(stmt.query_row(params![id], read_claim)?)
}

fn active_claim_tx(conn: &Connection, task_id: &TaskId) -> Result<Option<TaskClaim>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {CLAIM_COLUMNS} FROM task_claims WHERE task_id = ?1 AND status = 'active'"
    ))?;
    Ok(stmt.query_row(params![task_id], read_claim).optional()?)
}
